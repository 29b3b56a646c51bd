//! Unwinding allocates, and a child cloned while another thread holds the heap lock would
//! hang forever. Without the test harness this process has a single thread, so the cloned
//! child can unwind safely.

use std::ffi::c_int;

use nsrun::spawn::{clone_child, ChildStack, Isolation, PANIC_EXIT_CODE};
use nsrun::ExitStatus;

fn panic_in_entry_is_caught() {
    let mut stack = ChildStack::new();
    let child = unsafe {
        clone_child(Isolation::default(), &mut stack, &mut || -> c_int {
            panic!("boom")
        })
    }
    .unwrap();
    assert_eq!(child.wait().unwrap(), ExitStatus::Code(PANIC_EXIT_CODE));
}

fn main() {
    panic_in_entry_is_caught();
    println!("test panic_in_entry_is_caught ... ok");
}
