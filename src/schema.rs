//! Table schema: typed columns, index declarations, and the on-disk `.desc`
//! descriptor format.
//!
//! A schema is immutable for the lifetime of an open table — columns and
//! indexes cannot be added or dropped without recreating the table. The
//! descriptor is a small text file (`<table>.desc`) written once at
//! `Table::create` time and read back at `Table::open` time; it exists so a
//! table's files are self-describing without requiring the application to
//! re-supply the schema on every open.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Errors raised while building or parsing a [`Schema`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchemaError {
    /// Underlying I/O error reading or writing a `.desc` file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The `.desc` text could not be parsed.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// A schema invariant was violated (e.g. no primary index, duplicate
    /// column name, index over an unknown column).
    #[error("invalid schema: {0}")]
    Invalid(String),

    /// Encoding/decoding error while (de)serializing schema metadata.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// The type of a single column.
///
/// Widths are fixed at schema-definition time; `Str(n)`/`Bytes(n)` bound the
/// maximum length of a variable-length value, not its stored width (storage
/// is length-prefixed — see [`crate::codec`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Fixed-scale decimal stored as an `i64` mantissa: `precision` is the
    /// total number of significant digits, `scale` the digits after the
    /// point.
    Decimal { precision: u8, scale: u8 },
    /// UTF-8 text, at most `n` bytes.
    Str(u32),
    /// Arbitrary bytes, at most `n` bytes.
    Bytes(u32),
    /// Days since the Unix epoch, stored as `i32`.
    Date,
    /// Microseconds since the Unix epoch, stored as `i64`.
    Time,
    Uuid,
    Ipv6,
    /// The unit type; a column of this type is always NULL and carries no
    /// storage beyond the row's NULL bitmap. Used by adapters, not expected
    /// in ordinary tables.
    Nil,
}

impl ColumnType {
    /// Fixed on-disk width in bytes for types whose storage size does not
    /// depend on the value (everything but `Str`/`Bytes`, which are
    /// length-prefixed, and `Nil`, which occupies zero bytes).
    pub fn fixed_width(self) -> Option<usize> {
        use ColumnType::*;
        match self {
            I8 | U8 => Some(1),
            I16 | U16 => Some(2),
            I32 | U32 | F32 | Date => Some(4),
            I64 | U64 | F64 | Time | Decimal { .. } => Some(8),
            Uuid => Some(16),
            Ipv6 => Some(16),
            Str(_) | Bytes(_) => None,
            Nil => Some(0),
        }
    }

    fn tag(self) -> u8 {
        use ColumnType::*;
        match self {
            I8 => 0,
            U8 => 1,
            I16 => 2,
            U16 => 3,
            I32 => 4,
            U32 => 5,
            I64 => 6,
            U64 => 7,
            F32 => 8,
            F64 => 9,
            Decimal { .. } => 10,
            Str(_) => 11,
            Bytes(_) => 12,
            Date => 13,
            Time => 14,
            Uuid => 15,
            Ipv6 => 16,
            Nil => 17,
        }
    }

    fn name(self) -> &'static str {
        use ColumnType::*;
        match self {
            I8 => "I8",
            U8 => "U8",
            I16 => "I16",
            U16 => "U16",
            I32 => "I32",
            U32 => "U32",
            I64 => "I64",
            U64 => "U64",
            F32 => "F32",
            F64 => "F64",
            Decimal { .. } => "DECIMAL",
            Str(_) => "STRING",
            Bytes(_) => "BYTES",
            Date => "DATE",
            Time => "TIME",
            Uuid => "UUID",
            Ipv6 => "IPV6",
            Nil => "NIL",
        }
    }

    /// Parse a type directive like `STRING(100)` or `DECIMAL(10,2)` as found
    /// in a `.desc` file's `COLUMN` line.
    fn parse(spec: &str) -> Result<Self, SchemaError> {
        let spec = spec.trim();
        let (head, args) = match spec.find('(') {
            Some(idx) => {
                let args = spec[idx + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| SchemaError::MalformedDescriptor(format!("unbalanced parens in {spec}")))?;
                (&spec[..idx], Some(args))
            }
            None => (spec, None),
        };
        let head = head.trim().to_ascii_uppercase();
        let parse_u32 = |s: &str, field: &str| -> Result<u32, SchemaError> {
            s.trim()
                .parse::<u32>()
                .map_err(|_| SchemaError::MalformedDescriptor(format!("bad {field} in {spec}")))
        };
        Ok(match head.as_str() {
            "I8" => ColumnType::I8,
            "U8" => ColumnType::U8,
            "I16" => ColumnType::I16,
            "U16" => ColumnType::U16,
            "I32" => ColumnType::I32,
            "U32" => ColumnType::U32,
            "I64" => ColumnType::I64,
            "U64" => ColumnType::U64,
            "F32" => ColumnType::F32,
            "F64" => ColumnType::F64,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "UUID" => ColumnType::Uuid,
            "IPV6" => ColumnType::Ipv6,
            "NIL" => ColumnType::Nil,
            "STRING" => {
                let n = args.ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("STRING requires a length: {spec}"))
                })?;
                ColumnType::Str(parse_u32(n, "STRING length")?)
            }
            "BYTES" => {
                let n = args.ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("BYTES requires a length: {spec}"))
                })?;
                ColumnType::Bytes(parse_u32(n, "BYTES length")?)
            }
            "DECIMAL" => {
                let args = args.ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("DECIMAL requires (precision,scale): {spec}"))
                })?;
                let mut parts = args.split(',');
                let precision = parts
                    .next()
                    .ok_or_else(|| SchemaError::MalformedDescriptor(spec.to_string()))?;
                let scale = parts
                    .next()
                    .ok_or_else(|| SchemaError::MalformedDescriptor(spec.to_string()))?;
                ColumnType::Decimal {
                    precision: parse_u32(precision, "DECIMAL precision")? as u8,
                    scale: parse_u32(scale, "DECIMAL scale")? as u8,
                }
            }
            other => {
                return Err(SchemaError::MalformedDescriptor(format!(
                    "unknown column type {other}"
                )));
            }
        })
    }

    fn directive(self) -> String {
        match self {
            ColumnType::Str(n) => format!("STRING({n})"),
            ColumnType::Bytes(n) => format!("BYTES({n})"),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            other => other.name().to_string(),
        }
    }
}

impl Encode for ColumnType {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tag().encode_to(buf)?;
        if let ColumnType::Str(n) | ColumnType::Bytes(n) = self {
            n.encode_to(buf)?;
        }
        if let ColumnType::Decimal { precision, scale } = self {
            precision.encode_to(buf)?;
            scale.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for ColumnType {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let ty = match tag {
            0 => ColumnType::I8,
            1 => ColumnType::U8,
            2 => ColumnType::I16,
            3 => ColumnType::U16,
            4 => ColumnType::I32,
            5 => ColumnType::U32,
            6 => ColumnType::I64,
            7 => ColumnType::U64,
            8 => ColumnType::F32,
            9 => ColumnType::F64,
            10 => {
                let (precision, n) = u8::decode_from(&buf[offset..])?;
                offset += n;
                let (scale, n) = u8::decode_from(&buf[offset..])?;
                offset += n;
                ColumnType::Decimal { precision, scale }
            }
            11 => {
                let (n_len, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                ColumnType::Str(n_len)
            }
            12 => {
                let (n_len, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                ColumnType::Bytes(n_len)
            }
            13 => ColumnType::Date,
            14 => ColumnType::Time,
            15 => ColumnType::Uuid,
            16 => ColumnType::Ipv6,
            17 => ColumnType::Nil,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "ColumnType",
                });
            }
        };
        Ok((ty, offset))
    }
}

/// A single table column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
        }
    }
}

/// The kind of a declared index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// The unique, required, row-addressing index. Every table has exactly
    /// one, backed by a B+ tree so range scans over the primary key are
    /// possible.
    Primary,
    /// A secondary B+ tree index supporting ordered scans and range
    /// predicates over a non-primary column set.
    Sort,
    /// A secondary hash index supporting equality lookups only.
    Hash,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::Primary => "PRIMARY",
            IndexKind::Sort => "SORT",
            IndexKind::Hash => "HASH",
        })
    }
}

/// A declared index: a name, its kind, and the ordered column list its key
/// is composed from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, kind: IndexKind, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            columns,
        }
    }
}

/// Whether the table maintains a write-ahead log, and if so, whether it is
/// retained after a checkpoint or truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalMode {
    /// No WAL. Writes are applied directly to the primary/index files;
    /// a crash mid-write can leave the table in an inconsistent state.
    Off,
    /// WAL is kept, retaining every record since the last checkpoint was
    /// taken, for point-in-time recovery.
    Log,
    /// WAL is truncated to empty on every successful checkpoint. This is
    /// the default: the common case, minimizing steady-state disk usage
    /// while still protecting against crash loss of unflushed data.
    #[default]
    Truncate,
}

impl WalMode {
    fn parse(s: &str) -> Result<Self, SchemaError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(WalMode::Off),
            "LOG" => Ok(WalMode::Log),
            "TRUNCATE" => Ok(WalMode::Truncate),
            other => Err(SchemaError::MalformedDescriptor(format!(
                "unknown WAL mode {other}"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            WalMode::Off => "OFF",
            WalMode::Log => "LOG",
            WalMode::Truncate => "TRUNCATE",
        }
    }
}

/// The compressor applied to variable-length column payloads before they
/// are written to a block. `None` is the default. The other four variants
/// round-trip through the `.desc` descriptor like every other schema
/// setting; see `DESIGN.md`'s Open Question decisions for why block/row
/// encoding does not yet dispatch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compressor {
    #[default]
    None,
    Deflate,
    Snappy,
    Lz4,
    Zstd,
}

impl Compressor {
    fn parse(s: &str) -> Result<Self, SchemaError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Compressor::None),
            "DEFLATE" => Ok(Compressor::Deflate),
            "SNAPPY" => Ok(Compressor::Snappy),
            "LZ4" => Ok(Compressor::Lz4),
            "ZSTD" => Ok(Compressor::Zstd),
            other => Err(SchemaError::MalformedDescriptor(format!(
                "unknown compressor {other}"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Compressor::None => "NONE",
            Compressor::Deflate => "DEFLATE",
            Compressor::Snappy => "SNAPPY",
            Compressor::Lz4 => "LZ4",
            Compressor::Zstd => "ZSTD",
        }
    }
}

/// Total entries across all cache shards when a schema does not specify
/// one explicitly — matches `CacheConfig::default()`'s `per_shard_capacity
/// (256) * DEFAULT_SHARDS (16)`.
const DEFAULT_CACHE_CAPACITY: u32 = 4096;

/// Matches `BlockStorageConfig::default().growth_blocks`.
const DEFAULT_MMAP_INCREMENT_BLOCKS: u32 = 256;

/// Free blocks that must accumulate before a `BlockStorage::compact` pass
/// is worth running; matches `BlockStorageConfig::default().growth_blocks`
/// so a table's compaction unit tracks its growth unit unless overridden.
const DEFAULT_COMPACT_UNIT_BLOCKS: u32 = 256;

/// A table's full, immutable schema: its columns, its indexes (exactly one
/// of which is [`IndexKind::Primary`]), and the table-level storage
/// settings that are fixed at creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexSpec>,
    pub wal_mode: WalMode,
    pub compressor: Compressor,
    /// Approximate total cache entry budget (see `CacheConfig::with_total_capacity`).
    pub cache_capacity: u32,
    /// Blocks to grow `BlockStorage` by when its free list is exhausted.
    pub mmap_increment_blocks: u32,
    /// Free blocks that must accumulate before compaction is worthwhile.
    pub compact_unit_blocks: u32,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up a column's position by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The table's single primary index.
    pub fn primary_index(&self) -> &IndexSpec {
        self.indexes
            .iter()
            .find(|ix| ix.kind == IndexKind::Primary)
            .expect("Schema::build guarantees exactly one primary index")
    }

    pub fn secondary_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.iter().filter(|ix| ix.kind != IndexKind::Primary)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|ix| ix.name == name)
    }

    /// Validate the structural invariants a schema must hold before a table
    /// can be created or opened against it.
    fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::Invalid("schema has no columns".into()));
        }
        let mut seen = HashMap::new();
        for col in &self.columns {
            if seen.insert(col.name.as_str(), ()).is_some() {
                return Err(SchemaError::Invalid(format!(
                    "duplicate column name {:?}",
                    col.name
                )));
            }
        }
        let primaries = self
            .indexes
            .iter()
            .filter(|ix| ix.kind == IndexKind::Primary)
            .count();
        if primaries != 1 {
            return Err(SchemaError::Invalid(format!(
                "schema must declare exactly one PRIMARY index, found {primaries}"
            )));
        }
        let mut index_names = HashMap::new();
        for ix in &self.indexes {
            if index_names.insert(ix.name.as_str(), ()).is_some() {
                return Err(SchemaError::Invalid(format!(
                    "duplicate index name {:?}",
                    ix.name
                )));
            }
            if ix.columns.is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "index {:?} has no columns",
                    ix.name
                )));
            }
            for col_name in &ix.columns {
                if self.column_index(col_name).is_none() {
                    return Err(SchemaError::Invalid(format!(
                        "index {:?} references unknown column {:?}",
                        ix.name, col_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render the schema as the text contents of a `.desc` file.
    ///
    /// Format: one `KEY=VALUE` pair per line for table-level settings,
    /// followed by one `COLUMN name TYPE NULL|NOTNULL` line per column and
    /// one `INDEX name KIND col1,col2,...` line per index.
    pub fn to_descriptor(&self) -> String {
        let mut out = String::new();
        out.push_str("VERSION=1\n");
        out.push_str(&format!("WAL={}\n", self.wal_mode.as_str()));
        out.push_str(&format!("COMPRESSOR={}\n", self.compressor.as_str()));
        out.push_str(&format!("CACHE={}\n", self.cache_capacity));
        out.push_str(&format!("MMAP={}\n", self.mmap_increment_blocks));
        out.push_str(&format!("COMPACT={}\n", self.compact_unit_blocks));
        for col in &self.columns {
            out.push_str(&format!(
                "COLUMN {} {} {}\n",
                col.name,
                col.ty.directive(),
                if col.nullable { "NULL" } else { "NOTNULL" }
            ));
        }
        for ix in &self.indexes {
            out.push_str(&format!(
                "INDEX {} {} {}\n",
                ix.name,
                ix.kind,
                ix.columns.join(",")
            ));
        }
        out
    }

    /// Parse a schema back from the text contents of a `.desc` file.
    pub fn from_descriptor(text: &str) -> Result<Self, SchemaError> {
        let mut wal_mode = WalMode::default();
        let mut compressor = Compressor::default();
        let mut cache_capacity = DEFAULT_CACHE_CAPACITY;
        let mut mmap_increment_blocks = DEFAULT_MMAP_INCREMENT_BLOCKS;
        let mut compact_unit_blocks = DEFAULT_COMPACT_UNIT_BLOCKS;
        let mut columns = Vec::new();
        let mut indexes = Vec::new();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("COLUMN ") {
                let mut parts = rest.split_whitespace();
                let name = parts.next().ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("line {lineno}: missing column name"))
                })?;
                let ty_spec = parts.next().ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("line {lineno}: missing column type"))
                })?;
                let nullability = parts.next().unwrap_or("NOTNULL");
                let nullable = match nullability {
                    "NULL" => true,
                    "NOTNULL" => false,
                    other => {
                        return Err(SchemaError::MalformedDescriptor(format!(
                            "line {lineno}: bad nullability {other}"
                        )));
                    }
                };
                columns.push(Column::new(name, ColumnType::parse(ty_spec)?, nullable));
            } else if let Some(rest) = line.strip_prefix("INDEX ") {
                let mut parts = rest.split_whitespace();
                let name = parts.next().ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("line {lineno}: missing index name"))
                })?;
                let kind = parts.next().ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("line {lineno}: missing index kind"))
                })?;
                let kind = match kind {
                    "PRIMARY" => IndexKind::Primary,
                    "SORT" => IndexKind::Sort,
                    "HASH" => IndexKind::Hash,
                    other => {
                        return Err(SchemaError::MalformedDescriptor(format!(
                            "line {lineno}: unknown index kind {other}"
                        )));
                    }
                };
                let cols = parts.next().ok_or_else(|| {
                    SchemaError::MalformedDescriptor(format!("line {lineno}: missing index columns"))
                })?;
                let columns = cols.split(',').map(str::to_string).collect();
                indexes.push(IndexSpec::new(name, kind, columns));
            } else if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "VERSION" => {}
                    "WAL" => wal_mode = WalMode::parse(value)?,
                    "COMPRESSOR" => compressor = Compressor::parse(value)?,
                    "CACHE" => cache_capacity = parse_u32_field(value, "CACHE")?,
                    "MMAP" => mmap_increment_blocks = parse_u32_field(value, "MMAP")?,
                    "COMPACT" => compact_unit_blocks = parse_u32_field(value, "COMPACT")?,
                    other => {
                        return Err(SchemaError::MalformedDescriptor(format!(
                            "line {lineno}: unknown directive {other}"
                        )));
                    }
                }
            } else {
                return Err(SchemaError::MalformedDescriptor(format!(
                    "line {lineno}: unrecognized line {line:?}"
                )));
            }
        }

        let schema = Schema {
            columns,
            indexes,
            wal_mode,
            compressor,
            cache_capacity,
            mmap_increment_blocks,
            compact_unit_blocks,
        };
        schema.validate()?;
        Ok(schema)
    }
}

/// Parse a `KEY=VALUE` directive's value as a `u32`, for the numeric
/// table-level settings (`CACHE`/`MMAP`/`COMPACT`).
fn parse_u32_field(value: &str, field: &str) -> Result<u32, SchemaError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| SchemaError::MalformedDescriptor(format!("bad {field} value {value:?}")))
}

/// Encode a schema using the binary [`crate::encoding`] format, for
/// embedding in contexts (e.g. tests) where round-tripping through the text
/// descriptor is unnecessary overhead.
impl Encode for Schema {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let text = self.to_descriptor();
        text.encode_to(buf)
    }
}

impl Decode for Schema {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (text, consumed) = String::decode_from(buf)?;
        let schema = Schema::from_descriptor(&text)
            .map_err(|e| EncodingError::Custom(format!("schema descriptor: {e}")))?;
        Ok((schema, consumed))
    }
}

/// Builds a [`Schema`], validating invariants on [`build`](Self::build).
#[derive(Debug)]
pub struct SchemaBuilder {
    columns: Vec<Column>,
    indexes: Vec<IndexSpec>,
    wal_mode: WalMode,
    compressor: Compressor,
    cache_capacity: u32,
    mmap_increment_blocks: u32,
    compact_unit_blocks: u32,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            indexes: Vec::new(),
            wal_mode: WalMode::default(),
            compressor: Compressor::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            mmap_increment_blocks: DEFAULT_MMAP_INCREMENT_BLOCKS,
            compact_unit_blocks: DEFAULT_COMPACT_UNIT_BLOCKS,
        }
    }
}

impl SchemaBuilder {
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn wal_mode(mut self, mode: WalMode) -> Self {
        self.wal_mode = mode;
        self
    }

    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn cache_capacity(mut self, capacity: u32) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn mmap_increment_blocks(mut self, blocks: u32) -> Self {
        self.mmap_increment_blocks = blocks;
        self
    }

    pub fn compact_unit_blocks(mut self, blocks: u32) -> Self {
        self.compact_unit_blocks = blocks;
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let schema = Schema {
            columns: self.columns,
            indexes: self.indexes,
            wal_mode: self.wal_mode,
            compressor: self.compressor,
            cache_capacity: self.cache_capacity,
            mmap_increment_blocks: self.mmap_increment_blocks,
            compact_unit_blocks: self.compact_unit_blocks,
        };
        schema.validate()?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::builder()
            .column(Column::new("id", ColumnType::U32, false))
            .column(Column::new("name", ColumnType::Str(64), false))
            .column(Column::new("balance", ColumnType::Decimal { precision: 10, scale: 2 }, true))
            .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
            .index(IndexSpec::new("by_name", IndexKind::Sort, vec!["name".into()]))
            .wal_mode(WalMode::Log)
            .build()
            .expect("valid schema")
    }

    #[test]
    fn descriptor_round_trips() {
        let schema = sample_schema();
        let text = schema.to_descriptor();
        let parsed = Schema::from_descriptor(&text).expect("parse");
        assert_eq!(schema, parsed);
    }

    #[test]
    fn rejects_schema_without_primary_index() {
        let result = Schema::builder()
            .column(Column::new("id", ColumnType::U32, false))
            .index(IndexSpec::new("by_id", IndexKind::Sort, vec!["id".into()]))
            .build();
        assert!(matches!(result, Err(SchemaError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_column_names() {
        let result = Schema::builder()
            .column(Column::new("id", ColumnType::U32, false))
            .column(Column::new("id", ColumnType::U32, false))
            .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
            .build();
        assert!(matches!(result, Err(SchemaError::Invalid(_))));
    }

    #[test]
    fn rejects_index_over_unknown_column() {
        let result = Schema::builder()
            .column(Column::new("id", ColumnType::U32, false))
            .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
            .index(IndexSpec::new("bogus", IndexKind::Hash, vec!["nope".into()]))
            .build();
        assert!(matches!(result, Err(SchemaError::Invalid(_))));
    }

    #[test]
    fn column_type_directives_round_trip() {
        for ty in [
            ColumnType::I8,
            ColumnType::U64,
            ColumnType::F64,
            ColumnType::Str(128),
            ColumnType::Bytes(16),
            ColumnType::Decimal { precision: 18, scale: 4 },
            ColumnType::Date,
            ColumnType::Time,
            ColumnType::Uuid,
            ColumnType::Ipv6,
        ] {
            let directive = ty.directive();
            let parsed = ColumnType::parse(&directive).expect("parse");
            assert_eq!(ty, parsed);
        }
    }

    #[test]
    fn fixed_width_matches_wire_sizes() {
        assert_eq!(ColumnType::U32.fixed_width(), Some(4));
        assert_eq!(ColumnType::Uuid.fixed_width(), Some(16));
        assert_eq!(ColumnType::Str(10).fixed_width(), None);
    }
}
