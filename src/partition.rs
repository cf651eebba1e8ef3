// swifota/src/partition.rs

use log::warn;

use crate::error::{Error, Result};

/// Name of the staging partition receiving the downloaded package.
pub const SWIFOTA_PARTITION: &str = "swifota";

/// One line of the partition manifest: a partition name and its size in
/// physical erase blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub nb_peb: u32,
}

/// The board's partition manifest, a plain-text table of
/// `<name> <size-in-PEBs>` lines. `#` starts a comment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(name), Some(size)) = (fields.next(), fields.next()) else {
                warn!("partition manifest line {}: missing field, skipped", lineno + 1);
                continue;
            };
            let nb_peb: u32 = size
                .parse()
                .map_err(|_| Error::Format("partition size is not a number"))?;
            if nb_peb == 0 {
                return Err(Error::Format("partition with zero blocks"));
            }
            if entries.iter().any(|e: &PartitionEntry| e.name == name) {
                return Err(Error::Duplicate("partition name repeated in manifest"));
            }
            entries.push(PartitionEntry { name: name.to_string(), nb_peb });
        }
        Ok(PartitionTable { entries })
    }

    pub fn get(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Index of a partition in manifest order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn staging(&self) -> Result<&PartitionEntry> {
        self.get(SWIFOTA_PARTITION).ok_or(Error::NotFound("no swifota partition in manifest"))
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_sizes_and_comments() -> Result<()> {
        let table = PartitionTable::parse(
            "# boot layout\nsbl 12\nmodem 120\nswifota 64  # staging\n",
        )?;
        assert_eq!(table.entries().len(), 3);
        assert_eq!(table.staging()?.nb_peb, 64);
        assert_eq!(table.index_of("modem"), Some(1));
        Ok(())
    }

    #[test]
    fn duplicate_names_are_refused() {
        assert!(matches!(
            PartitionTable::parse("a 1\na 2\n"),
            Err(Error::Duplicate(_))
        ));
    }

    #[test]
    fn missing_staging_partition_is_reported() -> Result<()> {
        let table = PartitionTable::parse("sbl 12\n")?;
        assert!(matches!(table.staging(), Err(Error::NotFound(_))));
        Ok(())
    }
}
