// kiln-aio/src/lib.rs
//! IO primitives for kiln: filesystem, archives, checksums, git, processes, JSON.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod git2;
pub mod json_io;
pub mod process;

pub use checksum::verify_checksum_async;
pub use extract::extract_archive_async;
pub use json_io::{read_json_async, write_json_async};
pub use process::{run_command_async, CommandOutput, CommandSpec};
