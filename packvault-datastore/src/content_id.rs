//! Content identifiers.
//!
//! A content id is the keyed digest of the plaintext with a one-byte category
//! prefix in front. The prefix partitions the id space: data contents, object
//! list contents, manifests and maintenance markers live side by side in the
//! same index but are cached and packed differently.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};

/// Wire size of a content id: prefix byte plus 32 digest bytes.
pub const CONTENT_ID_SIZE: usize = 33;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Regular file data. Rendered with an empty prefix.
    Data,
    /// Object list contents written by the object manager.
    Metadata,
    /// Snapshot manifests.
    Manifest,
    /// Maintenance markers (GC runs, upgrade state).
    Maintenance,
}

impl Category {
    pub fn prefix_byte(&self) -> u8 {
        match self {
            Category::Data => 0,
            Category::Metadata => b'k',
            Category::Manifest => b'm',
            Category::Maintenance => b'z',
        }
    }

    pub fn from_prefix_byte(byte: u8) -> Result<Self, Error> {
        Ok(match byte {
            0 => Category::Data,
            b'k' => Category::Metadata,
            b'm' => Category::Manifest,
            b'z' => Category::Maintenance,
            other => bail!("unknown content id prefix byte {:#04x}", other),
        })
    }

    /// Everything except file data is packed into metadata packs and cached
    /// in the metadata cache.
    pub fn is_metadata(&self) -> bool {
        !matches!(self, Category::Data)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    prefix: u8,
    digest: [u8; 32],
}

impl ContentId {
    pub fn new(category: Category, digest: [u8; 32]) -> Self {
        Self {
            prefix: category.prefix_byte(),
            digest,
        }
    }

    pub fn category(&self) -> Category {
        // the prefix byte was validated on construction
        Category::from_prefix_byte(self.prefix).unwrap()
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Serialize into the 33 byte wire form.
    pub fn to_wire(&self) -> [u8; CONTENT_ID_SIZE] {
        let mut wire = [0u8; CONTENT_ID_SIZE];
        wire[0] = self.prefix;
        wire[1..].copy_from_slice(&self.digest);
        wire
    }

    pub fn from_wire(wire: &[u8]) -> Result<Self, Error> {
        if wire.len() != CONTENT_ID_SIZE {
            bail!("content id has wrong length {}", wire.len());
        }
        let category = Category::from_prefix_byte(wire[0])?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&wire[1..]);
        Ok(Self::new(category, digest))
    }
}

/// Ids sort by their wire bytes (category first, then digest), which is the
/// sort order of index blobs.
impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.prefix, &self.digest).cmp(&(other.prefix, &other.digest))
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.prefix != 0 {
            write!(f, "{}", self.prefix as char)?;
        }
        write!(f, "{}", hex::encode(self.digest))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let (category, hex_part) = match text.len() {
            64 => (Category::Data, text),
            65 => {
                let category = Category::from_prefix_byte(text.as_bytes()[0])?;
                if category == Category::Data {
                    bail!("data content ids carry no prefix character");
                }
                (category, &text[1..])
            }
            len => bail!("content id has wrong text length {}", len),
        };
        let raw = hex::decode(hex_part)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&raw);
        Ok(Self::new(category, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(fill: u8) -> [u8; 32] {
        [fill; 32]
    }

    #[test]
    fn text_round_trip() {
        for category in [
            Category::Data,
            Category::Metadata,
            Category::Manifest,
            Category::Maintenance,
        ] {
            let id = ContentId::new(category, digest(0xab));
            let parsed: ContentId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed.category(), category);
        }
    }

    #[test]
    fn data_ids_have_no_prefix_char() {
        let id = ContentId::new(Category::Data, digest(0x01));
        assert_eq!(id.to_string().len(), 64);
        let id = ContentId::new(Category::Manifest, digest(0x01));
        assert_eq!(id.to_string().len(), 65);
        assert!(id.to_string().starts_with('m'));
    }

    #[test]
    fn wire_round_trip() {
        let id = ContentId::new(Category::Metadata, digest(0x7f));
        let wire = id.to_wire();
        assert_eq!(wire.len(), CONTENT_ID_SIZE);
        assert_eq!(ContentId::from_wire(&wire).unwrap(), id);
    }

    #[test]
    fn sort_order_groups_by_category() {
        let data = ContentId::new(Category::Data, digest(0xff));
        let meta = ContentId::new(Category::Metadata, digest(0x00));
        assert!(data < meta);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ContentId::from_wire(&[0u8; 10]).is_err());
        assert!("Q00".parse::<ContentId>().is_err());
        assert!(Category::from_prefix_byte(b'!').is_err());
    }
}
