//! # contactledger-mime
//!
//! Header-level MIME toolkit used by the contact extraction pipeline.
//!
//! ## Features
//!
//! - **Header blocks**: Parse raw RFC 5322 header sections, including folded lines
//! - **Address lists**: Split `From`/`To`/`Cc`/`Bcc` values into entries, handling
//!   quoted display names, comments, angle addresses and groups
//! - **Encoded words**: Decode RFC 2047 `B` and `Q` encoded display names
//! - **Dates**: Lenient RFC 2822 `Date` header parsing
//!
//! Nothing in this crate panics or fails on malformed input; parsers return
//! what they could recover and leave the decision about the rest to the caller.
//!
//! ## Quick Start
//!
//! ```ignore
//! use contactledger_mime::{Headers, parse_address_list};
//!
//! let headers = Headers::parse("From: =?utf-8?Q?J=C3=BCrgen?= <jurgen@example.com>\r\n\r\n");
//! let entries = parse_address_list(headers.get("From").unwrap_or_default());
//! assert_eq!(entries[0].display_name.as_deref(), Some("Jürgen"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
mod date;
mod error;
mod header;

pub mod encoding;

pub use address::{AddressEntry, AddressError, parse_address_list, validate_address};
pub use date::parse_date;
pub use error::{Error, Result};
pub use header::Headers;
