//! Serial console macros.
//!
//! All kernel diagnostics go out over COM1; there is no VGA text mode in
//! scope here (the higher layers that would own a console are external
//! collaborators). `println!`/`print!` are the raw sink; `logging` builds
//! a leveled `log::Log` backend on top of them.

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
