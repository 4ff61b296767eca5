//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Local command execution returning optional output
//! - `io` - File I/O with consistent error handling
//! - `shell` - Shell escaping, quoting and `sh -c` invocation
//! - `slugify` - Branch name sanitization
//! - `template` - printf-style template rendering

pub mod command;
pub mod io;
pub mod shell;
pub mod slugify;
pub mod template;
