// Existence Index
//
// Probabilistic record-key index embedded in every base file. No false
// negatives, bounded false-positive rate. The dynamic variant adds a
// sub-filter every `num_entries` keys until `max_entries` is reached,
// keeping the false-positive rate stable for files larger than planned.

use base64::Engine;
use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"TMBF";
const FORMAT_VERSION: u8 = 1;

/// Sizing rules for the existence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BloomFilterType {
    Simple,
    #[default]
    Dynamic,
}

/// Sizing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomFilterConfig {
    pub num_entries: usize,
    pub fpp: f64,
    pub dynamic_max_entries: usize,
    pub filter_type: BloomFilterType,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            num_entries: 60_000,
            fpp: 0.000_000_001,
            dynamic_max_entries: 100_000,
            filter_type: BloomFilterType::Dynamic,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BloomError {
    #[error("bloom filter data is truncated")]
    Truncated,

    #[error("not a bloom filter (bad magic or version)")]
    BadHeader,

    #[error("invalid base64 bloom filter: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Key filter embedded in a data file.
pub struct BloomFilter {
    filter_type: BloomFilterType,
    fpp: f64,
    entries_per_filter: usize,
    max_entries: usize,
    inserted: usize,
    filters: Vec<Bloom<[u8]>>,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("filter_type", &self.filter_type)
            .field("fpp", &self.fpp)
            .field("entries_per_filter", &self.entries_per_filter)
            .field("max_entries", &self.max_entries)
            .field("inserted", &self.inserted)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl BloomFilter {
    pub fn new(config: &BloomFilterConfig) -> Self {
        let entries_per_filter = config.num_entries.max(1);
        let max_entries = match config.filter_type {
            BloomFilterType::Simple => entries_per_filter,
            BloomFilterType::Dynamic => config.dynamic_max_entries.max(entries_per_filter),
        };

        Self {
            filter_type: config.filter_type,
            fpp: config.fpp,
            entries_per_filter,
            max_entries,
            inserted: 0,
            filters: vec![Bloom::new_for_fp_rate(entries_per_filter, config.fpp)],
        }
    }

    pub fn add(&mut self, key: &str) {
        let capacity = self.filters.len() * self.entries_per_filter;
        if self.filter_type == BloomFilterType::Dynamic
            && self.inserted >= capacity
            && capacity < self.max_entries
        {
            self.filters
                .push(Bloom::new_for_fp_rate(self.entries_per_filter, self.fpp));
        }

        if let Some(current) = self.filters.last_mut() {
            current.set(key.as_bytes());
        }
        self.inserted += 1;
    }

    /// `false` means the key is definitely absent.
    pub fn might_contain(&self, key: &str) -> bool {
        self.filters.iter().any(|f| f.check(key.as_bytes()))
    }

    pub fn filter_type(&self) -> BloomFilterType {
        self.filter_type
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn sub_filters(&self) -> usize {
        self.filters.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(match self.filter_type {
            BloomFilterType::Simple => 0,
            BloomFilterType::Dynamic => 1,
        });
        buf.extend_from_slice(&self.fpp.to_le_bytes());
        buf.extend_from_slice(&(self.entries_per_filter as u64).to_le_bytes());
        buf.extend_from_slice(&(self.max_entries as u64).to_le_bytes());
        buf.extend_from_slice(&(self.inserted as u64).to_le_bytes());
        buf.extend_from_slice(&(self.filters.len() as u32).to_le_bytes());

        for filter in &self.filters {
            let bitmap = filter.bitmap();
            let sip_keys = filter.sip_keys();
            buf.extend_from_slice(&filter.number_of_bits().to_le_bytes());
            buf.extend_from_slice(&filter.number_of_hash_functions().to_le_bytes());
            for (k0, k1) in sip_keys {
                buf.extend_from_slice(&k0.to_le_bytes());
                buf.extend_from_slice(&k1.to_le_bytes());
            }
            buf.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bitmap);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BloomError> {
        let mut cursor = Cursor { data, pos: 0 };

        if cursor.take(4)? != MAGIC || cursor.u8()? != FORMAT_VERSION {
            return Err(BloomError::BadHeader);
        }
        let filter_type = match cursor.u8()? {
            0 => BloomFilterType::Simple,
            1 => BloomFilterType::Dynamic,
            _ => return Err(BloomError::BadHeader),
        };
        let fpp = f64::from_le_bytes(cursor.array()?);
        let entries_per_filter = cursor.u64()? as usize;
        let max_entries = cursor.u64()? as usize;
        let inserted = cursor.u64()? as usize;
        let count = cursor.u32()? as usize;

        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let num_bits = cursor.u64()?;
            let num_hashes = cursor.u32()?;
            let sip_keys = [
                (cursor.u64()?, cursor.u64()?),
                (cursor.u64()?, cursor.u64()?),
            ];
            let bitmap_len = cursor.u32()? as usize;
            let bitmap = cursor.take(bitmap_len)?;
            filters.push(Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys));
        }

        Ok(Self {
            filter_type,
            fpp,
            entries_per_filter,
            max_entries,
            inserted,
            filters,
        })
    }

    /// Text form for key/value file footers.
    pub fn serialize_to_string(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn deserialize_from_string(text: &str) -> Result<Self, BloomError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(text)?;
        Self::from_bytes(&bytes)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], BloomError> {
        let end = self.pos.checked_add(len).ok_or(BloomError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(BloomError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BloomError> {
        self.take(N)?.try_into().map_err(|_| BloomError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, BloomError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, BloomError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, BloomError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
