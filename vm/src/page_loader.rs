use std::{fmt, sync::Arc};

use crate::{
    error::{Result, VmError},
    frame_table::Vpn,
};

/// Supplies the initial contents of image-backed pages.
pub trait PageLoader: Send + Sync {
    /// Fills `target` with page `page_number` counted from the start of the
    /// section.
    fn load_page_into(&self, page_number: usize, target: &mut [u8]);
}

/// A section image held in memory. The tail of a short last page reads as zero.
#[derive(Debug, Clone)]
pub struct BytesImage {
    bytes: Vec<u8>,
}

impl BytesImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        BytesImage { bytes }
    }
}

impl PageLoader for BytesImage {
    fn load_page_into(&self, page_number: usize, target: &mut [u8]) {
        let start = page_number * target.len();
        let source = self.bytes.get(start..).unwrap_or(&[]);
        let available = source.len().min(target.len());

        target[..available].copy_from_slice(&source[..available]);
        target[available..].fill(0);
    }
}

/// One contiguous run of pages backed by the executable image.
#[derive(Clone)]
pub struct Section {
    name: String,
    first_vpn: Vpn,
    length: usize,
    read_only: bool,
    loader: Arc<dyn PageLoader>,
}

impl Section {
    pub fn new(
        name: impl Into<String>,
        first_vpn: Vpn,
        length: usize,
        read_only: bool,
        loader: Arc<dyn PageLoader>,
    ) -> Self {
        Section {
            name: name.into(),
            first_vpn,
            length,
            read_only,
            loader,
        }
    }

    pub fn first_vpn(&self) -> Vpn {
        self.first_vpn
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn contains(&self, vpn: Vpn) -> bool {
        (self.first_vpn..self.first_vpn + self.length).contains(&vpn)
    }

    pub fn load_page(&self, page_number: usize, frame: &mut [u8]) {
        self.loader.load_page_into(page_number, frame);
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("first_vpn", &self.first_vpn)
            .field("length", &self.length)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// What the loader knows about a program when its address space is built.
#[derive(Debug, Clone, Default)]
pub struct ProgramImage {
    sections: Vec<Section>,
    stack_pages: usize,
}

impl ProgramImage {
    pub fn new(stack_pages: usize) -> Self {
        ProgramImage {
            sections: Vec::new(),
            stack_pages,
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    /// Pages in the address space: the sections, laid out back to back from
    /// page 0, followed by the stack.
    pub fn page_count(&self) -> Result<usize> {
        let mut pages = 0;

        for section in &self.sections {
            if section.first_vpn != pages {
                return Err(VmError::FragmentedImage {
                    name: section.name.clone(),
                    first_vpn: section.first_vpn,
                    expected: pages,
                });
            }
            pages += section.length;
        }

        Ok(pages + self.stack_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bytes: &[u8]) -> Arc<dyn PageLoader> {
        Arc::new(BytesImage::new(bytes.to_vec()))
    }

    #[test]
    fn bytes_image_pads_the_last_page() {
        let loader = BytesImage::new(vec![1, 2, 3, 4, 5, 6]);
        let mut page = [0xFF; 4];

        loader.load_page_into(1, &mut page);
        assert_eq!(page, [5, 6, 0, 0]);

        loader.load_page_into(3, &mut page);
        assert_eq!(page, [0; 4]);
    }

    #[test]
    fn page_count_adds_stack_after_sections() {
        let program = ProgramImage::new(3)
            .with_section(Section::new(".text", 0, 2, true, image(b"code")))
            .with_section(Section::new(".data", 2, 1, false, image(b"data")));

        assert_eq!(program.page_count().unwrap(), 6);
        assert!(program.sections()[0].contains(1));
        assert!(!program.sections()[0].contains(2));
    }

    #[test]
    fn gaps_between_sections_are_rejected() {
        let program = ProgramImage::new(1)
            .with_section(Section::new(".text", 0, 1, true, image(b"")))
            .with_section(Section::new(".bss", 3, 1, false, image(b"")));

        match program.page_count() {
            Err(VmError::FragmentedImage { name, first_vpn, expected }) => {
                assert_eq!(name, ".bss");
                assert_eq!(first_vpn, 3);
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
