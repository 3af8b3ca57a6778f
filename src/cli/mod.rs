//! Terminal front end for the programmer.

pub mod console;

pub use console::Console;
