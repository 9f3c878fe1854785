//! # Deskwatch Protocol Library
//!
//! The remote session tool is driven purely through external commands: the
//! only payloads are command lines going out and exit codes plus text coming
//! back. This crate describes that surface as data, without doing any I/O.
//!
//! - **Command templates**: the list, attach, detach, kill and screenshot
//!   command shapes, parameterised by machine name, session id and preview
//!   path.
//! - **Session list parsing**: turning the list command's output into
//!   session ids.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::CommandSet;
//!
//! let commands = CommandSet::default();
//! let list = commands.list_sessions("MACH1").unwrap();
//! assert_eq!(list.to_string(), "ssh MACH1 xpra list");
//!
//! let parser = commands.parser().unwrap();
//! let ids = parser.parse(b"LIVE session at :17\nLIVE session at :42\n");
//! assert_eq!(ids, vec![17, 42]);
//! ```
//!
//! ## Modules
//!
//! - [`command`]: Command templates and rendered command lines
//! - [`listing`]: Session list output parser
//! - [`error`]: Error types

pub mod command;
pub mod error;
pub mod listing;

pub use command::{CommandArgs, CommandLine, CommandSet, CommandTemplate, Placeholder};
pub use error::{ProtocolError, Result};
pub use listing::{SessionListParser, DEFAULT_MARKER};
