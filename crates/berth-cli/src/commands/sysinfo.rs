//! `berth sysinfo` — print detected system information.

use berth_image::arch::Arch;

/// Executes the `sysinfo` command.
#[allow(clippy::print_stdout)]
pub fn execute() {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    println!("OS: {}", std::env::consts::OS);
    println!("ARCH: {}", std::env::consts::ARCH);
    println!("CPUS: {cpus}");
    println!("Detected arch: {}", Arch::detect());
}
