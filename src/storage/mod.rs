//! Mailbox Storage (§4.E).

pub mod mailbox_store;

pub use mailbox_store::{MailboxStore, MessagePage};
