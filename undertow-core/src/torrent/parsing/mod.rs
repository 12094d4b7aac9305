//! Bencode codec and .torrent metainfo parsing.

pub mod bencode;
pub mod parser;
pub mod types;

pub use bencode::{BencodeError, Value};
pub use parser::BencodeTorrentParser;
pub use types::{TorrentDescriptor, TorrentParser};
