mod file_swap;

use std::{env, error::Error, str::FromStr, sync::Arc};

use log::info;
use vm::{
    page_loader::{PageLoader, ProgramImage, Section},
    page_table::PageOrigin,
    MachineConfig, Pid, Vm,
};

use crate::file_swap::FileSwap;

/// Image whose bytes encode the page they came from, so a reload is easy to
/// recognise in the output.
struct PatternImage {
    tag: u8,
}

impl PageLoader for PatternImage {
    fn load_page_into(&self, page_number: usize, target: &mut [u8]) {
        for (i, byte) in target.iter_mut().enumerate() {
            *byte = self.tag ^ ((page_number & 0xF) as u8) ^ (i as u8);
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn machine_config() -> MachineConfig {
    let mut config = MachineConfig::default()
        .with_page_size(env_or("VM_PAGE_SIZE", 64))
        .with_phys_pages(env_or("VM_PHYS_PAGES", 4))
        .with_tlb_size(env_or("VM_TLB_SIZE", 4));

    if let Some(seed) = env::var("VM_SEED").ok().and_then(|s| s.parse().ok()) {
        config = config.with_seed(seed);
    }

    config
}

fn dump(vm: &Vm, pid: Pid, vpn: usize) -> Result<(), Box<dyn Error>> {
    let page_size = vm.config().page_size;
    let mut page = vec![0; page_size];
    vm.read_bytes(vpn * page_size, &mut page)?;

    println!(
        "process {} page {} ({:?}): {}",
        pid,
        vpn,
        vm.page_origin(pid, vpn),
        hex::encode(&page[..page.len().min(16)])
    );

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = machine_config();
    let swap_path = env::var("VM_SWAP_FILE").unwrap_or_else(|_| "./swapfile.bin".to_owned());
    let vm = Vm::new(config, FileSwap::create(&swap_path)?)?;
    let page_size = config.page_size;

    // A: two writable image pages, one read-only image page, one stack page.
    let a: Pid = 1;
    let program_a = ProgramImage::new(1)
        .with_section(Section::new(".data", 0, 2, false, Arc::new(PatternImage { tag: 0xA0 })))
        .with_section(Section::new(".rodata", 2, 1, true, Arc::new(PatternImage { tag: 0xA5 })));
    // B: two anonymous pages.
    let b: Pid = 2;
    let program_b = ProgramImage::new(2);

    vm.create_address_space(a, program_a)?;
    vm.create_address_space(b, program_b)?;

    vm.switch_to(a)?;
    for vpn in 0..4 {
        vm.user_load(vpn * page_size)?;
    }
    vm.user_store(3 * page_size, 0xEE)?;
    let written = vm.write_bytes(2 * page_size, b"nope")?;
    info!("write to the read-only page moved {} bytes", written);

    vm.switch_to(b)?;
    vm.user_store(0, 0x42)?;
    vm.user_store(page_size + 1, 0x43)?;
    println!("after B ran: {:?}", vm.stats());

    vm.switch_to(a)?;
    for vpn in 0..4 {
        if vm.page_origin(a, vpn) == Some(PageOrigin::Swap) {
            println!("page {} of A went to swap", vpn);
        }
        dump(&vm, a, vpn)?;
    }
    assert_eq!(vm.user_load(3 * page_size)?, 0xEE);

    vm.switch_to(b)?;
    assert_eq!(vm.user_load(0)?, 0x42);
    assert_eq!(vm.user_load(page_size + 1)?, 0x43);

    vm.check_invariants()?;
    println!("final: {:?}", vm.stats());

    vm.release_address_space(a)?;
    vm.release_address_space(b)?;
    vm.shutdown()?;

    Ok(())
}
