use core::panic::PanicInfo;

use crate::arch;
use crate::console::print_unlocked;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::critical_enter();

    let core = arch::core_id();
    let msg = info.message();
    if let Some(location) = info.location() {
        print_unlocked(format_args!(
            "\u{1B}[31m[core {core}] Panicked at {}:{} {msg}\u{1B}[0m\n",
            location.file(),
            location.line(),
        ));
    } else {
        print_unlocked(format_args!("\u{1B}[31m[core {core}] Panicked: {msg}\u{1B}[0m\n"));
    }

    arch::park()
}
