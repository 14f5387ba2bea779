//! Directory synchronization over TCP.
//!
//! `syncmon` watches a single directory (non-recursively) and pushes every change to a `syncd`
//! receiver, one short-lived TCP connection per change. `syncd` stores incoming files under its
//! destination root and never silently loses content: when a file with the same name but
//! different content already exists, the old one is moved aside to `name_v<N>.ext`.
//!
//! # Usage
//!
//! ```bash
//! # on the receiving host
//! syncd /srv/inbox --bind 0.0.0.0:8080 -v
//!
//! # on the sending host
//! syncmon ~/outbox receiver.example.com:8080 -v
//! ```
//!
//! Editing `report.txt` from "v1" to "v2" and back to "v1" leaves the receiver with
//! `report.txt` = "v1", `report_v1.txt` = "v1" and `report_v2.txt` = "v2". Re-sending identical
//! content does not create a new version.
//!
//! # Deletions
//!
//! Removing a file from the watched directory sends a delete notice. By default `syncd` only logs
//! it; with `--propagate-deletes` it removes the current copy. Versioned copies are never removed.
//!
//! # Modules
//!
//! - [`watch`]: classifies file system notifications
//! - [`source`]: sending side, one transfer task per change
//! - [`destination`]: receiving side, one task per connection

pub mod destination;
pub mod source;
pub mod watch;
