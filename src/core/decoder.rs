//! Tag data decoder ring.
//!
//! Turns the hex-encoded EPC memory of an RFID tag into a URI. A ring holds
//! an ordered list of decoders; the first one that accepts the data wins.
//!
//! Supported encodings:
//!
//! - SGTIN-96 and SGTIN-198 (`urn:epc:id:sgtin:{company}.{item}.{serial}`)
//! - bit-packed tags with configured field widths
//!   (`tag:{authority},{date}:{field}.{field}...`)

use thiserror::Error;

use crate::config::properties::{TagConfig, TagFormat};

const SGTIN_96_HEADER: u8 = 0x30;
const SGTIN_198_HEADER: u8 = 0x36;
const SGTIN_96_SERIAL_BITS: u32 = 38;
const SGTIN_198_SERIAL_CHARS: usize = 20;

/// Company prefix and item reference layout per partition value:
/// (company bits, company digits, item bits, item digits).
const PARTITIONS: [(u32, usize, u32, usize); 7] = [
    (40, 12, 4, 1),
    (37, 11, 7, 2),
    (34, 10, 10, 3),
    (30, 9, 14, 4),
    (27, 8, 17, 5),
    (24, 7, 20, 6),
    (20, 6, 24, 7),
];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("failed to decode tag hex data: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid bit tag field widths: {0}")]
    InvalidWidths(String),

    #[error("not enough tag data: need {needed} bits, have {available}")]
    NotEnoughData { needed: usize, available: usize },

    #[error("not an SGTIN: unknown header 0x{0:02X}")]
    UnknownHeader(u8),

    #[error("invalid SGTIN partition value {0}")]
    InvalidPartition(u8),

    #[error("SGTIN serial has a non-zero character after its terminator")]
    SerialAfterTerminator,

    #[error("SGTIN {field} {value} does not fit in {digits} digits")]
    OutOfRange {
        field: &'static str,
        value: u64,
        digits: usize,
    },

    #[error("SGTIN serial character 0x{0:02X} is not allowed")]
    InvalidCharacter(u8),

    #[error(
        "no decoder successfully decoded the tag data: individual decoder errors are as follows:\n{0}"
    )]
    NoDecoder(String),
}

/// MSB-first bit cursor over a byte slice.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn available(&self) -> usize {
        self.data.len() * 8
    }

    fn require(&self, bits: usize) -> Result<(), DecodeError> {
        if bits > self.available() {
            return Err(DecodeError::NotEnoughData {
                needed: bits,
                available: self.available(),
            });
        }
        Ok(())
    }

    /// Reads `bits` (at most 64) bits.
    fn read(&mut self, bits: u32) -> Result<u64, DecodeError> {
        self.require(self.pos + bits as usize)?;
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        Ok(value)
    }
}

pub trait TagDecoder: Send + Sync {
    /// Decodes raw tag bytes into a URI.
    fn decode(&self, data: &[u8]) -> Result<String, DecodeError>;
}

/// Decoder for bit-packed tags: fixed-width unsigned fields, MSB first.
#[derive(Debug, Clone)]
pub struct BitTagDecoder {
    authority: String,
    date: String,
    widths: Vec<u32>,
}

impl BitTagDecoder {
    pub fn new(
        authority: impl Into<String>,
        date: impl Into<String>,
        widths: Vec<u32>,
    ) -> Result<Self, DecodeError> {
        if widths.is_empty() {
            return Err(DecodeError::InvalidWidths("at least one field is required".into()));
        }
        if let Some(width) = widths.iter().find(|w| !(1..=64).contains(*w)) {
            return Err(DecodeError::InvalidWidths(format!(
                "field width {width} is outside 1..=64"
            )));
        }

        Ok(Self {
            authority: authority.into(),
            date: date.into(),
            widths,
        })
    }

    fn total_bits(&self) -> usize {
        self.widths.iter().map(|w| *w as usize).sum()
    }
}

impl TagDecoder for BitTagDecoder {
    fn decode(&self, data: &[u8]) -> Result<String, DecodeError> {
        let mut reader = BitReader::new(data);
        reader.require(self.total_bits())?;

        let fields = self
            .widths
            .iter()
            .map(|width| reader.read(*width).map(|v| v.to_string()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(format!(
            "tag:{},{}:{}",
            self.authority,
            self.date,
            fields.join(".")
        ))
    }
}

/// A decoded SGTIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sgtin {
    pub filter: u8,
    pub partition: u8,
    pub company: u64,
    pub item: u64,
    pub serial: Serial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Serial {
    /// SGTIN-96: numeric serial.
    Numeric(u64),
    /// SGTIN-198: up to 20 seven-bit characters.
    Alphanumeric(Vec<u8>),
}

impl Sgtin {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BitReader::new(data);
        let header = reader.read(8)? as u8;
        let total_bits = match header {
            SGTIN_96_HEADER => 96,
            SGTIN_198_HEADER => 198,
            other => return Err(DecodeError::UnknownHeader(other)),
        };
        reader.require(total_bits)?;

        let filter = reader.read(3)? as u8;
        let partition = reader.read(3)? as u8;
        let (company_bits, _, item_bits, _) = *PARTITIONS
            .get(partition as usize)
            .ok_or(DecodeError::InvalidPartition(partition))?;
        let company = reader.read(company_bits)?;
        let item = reader.read(item_bits)?;

        let serial = if header == SGTIN_96_HEADER {
            Serial::Numeric(reader.read(SGTIN_96_SERIAL_BITS)?)
        } else {
            let mut chars = Vec::with_capacity(SGTIN_198_SERIAL_CHARS);
            let mut terminated = false;
            for _ in 0..SGTIN_198_SERIAL_CHARS {
                let c = reader.read(7)? as u8;
                match (c, terminated) {
                    (0, _) => terminated = true,
                    (_, true) => return Err(DecodeError::SerialAfterTerminator),
                    (c, false) => chars.push(c),
                }
            }
            Serial::Alphanumeric(chars)
        };

        Ok(Self {
            filter,
            partition,
            company,
            item,
            serial,
        })
    }

    /// Digit counts of company prefix and item reference, zero for an
    /// invalid partition.
    fn digits(&self) -> (usize, usize) {
        PARTITIONS
            .get(self.partition as usize)
            .map(|(_, company_digits, _, item_digits)| (*company_digits, *item_digits))
            .unwrap_or((0, 0))
    }

    /// Checks the values against the GS1 limits of the partition.
    pub fn validate_ranges(&self) -> Result<(), DecodeError> {
        let (company_digits, item_digits) = self.digits();
        for (field, value, digits) in [
            ("company prefix", self.company, company_digits),
            ("item reference", self.item, item_digits),
        ] {
            if value >= 10u64.pow(digits as u32) {
                return Err(DecodeError::OutOfRange {
                    field,
                    value,
                    digits,
                });
            }
        }

        if let Serial::Alphanumeric(chars) = &self.serial {
            if let Some(c) = chars.iter().find(|c| !is_gs1_ai82(**c)) {
                return Err(DecodeError::InvalidCharacter(*c));
            }
        }
        Ok(())
    }

    /// Pure-identity URI with URI-reserved serial characters escaped.
    pub fn uri(&self) -> String {
        let (company_digits, item_digits) = self.digits();
        let serial = match &self.serial {
            Serial::Numeric(n) => n.to_string(),
            Serial::Alphanumeric(chars) => chars.iter().map(|c| escape_uri_char(*c)).collect(),
        };
        format!(
            "urn:epc:id:sgtin:{:0cw$}.{:0iw$}.{}",
            self.company,
            self.item,
            serial,
            cw = company_digits,
            iw = item_digits
        )
    }
}

fn escape_uri_char(c: u8) -> String {
    match c {
        b'"' | b'%' | b'&' | b'/' | b'<' | b'>' | b'?' => format!("%{c:02X}"),
        _ => char::from(c).to_string(),
    }
}

/// GS1 AI-82 character set.
fn is_gs1_ai82(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'"'
                | b'%'
                | b'&'
                | b'\''
                | b'('
                | b')'
                | b'*'
                | b'+'
                | b','
                | b'-'
                | b'.'
                | b'/'
                | b':'
                | b';'
                | b'<'
                | b'='
                | b'>'
                | b'?'
                | b'_'
        )
}

/// Decoder for SGTIN-96 and SGTIN-198.
#[derive(Debug, Clone, Default)]
pub struct SgtinDecoder {
    strict: bool,
}

impl SgtinDecoder {
    /// In strict mode values outside GS1 limits are rejected.
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl TagDecoder for SgtinDecoder {
    fn decode(&self, data: &[u8]) -> Result<String, DecodeError> {
        let sgtin = Sgtin::decode(data)?;
        if self.strict {
            sgtin.validate_ranges()?;
        }
        Ok(sgtin.uri())
    }
}

/// Ordered list of decoders.
#[derive(Default)]
pub struct DecoderRing {
    decoders: Vec<Box<dyn TagDecoder>>,
}

impl DecoderRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the ring in the configured format order.
    pub fn from_config(config: &TagConfig) -> Result<Self, DecodeError> {
        let mut ring = Self::new();
        for format in &config.formats {
            match format {
                TagFormat::Sgtin => ring.add_sgtin_decoder(config.sgtin_strict),
                TagFormat::BitTag => ring.add_bit_tag_decoder(
                    &config.authority_name,
                    &config.authority_date,
                    config.bit_boundary.clone(),
                )?,
            }
        }
        Ok(ring)
    }

    pub fn add_bit_tag_decoder(
        &mut self,
        authority: &str,
        date: &str,
        widths: Vec<u32>,
    ) -> Result<(), DecodeError> {
        self.decoders
            .push(Box::new(BitTagDecoder::new(authority, date, widths)?));
        Ok(())
    }

    pub fn add_sgtin_decoder(&mut self, strict: bool) {
        self.decoders.push(Box::new(SgtinDecoder::new(strict)));
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Decodes hex tag data with the first decoder that accepts it.
    pub fn tag_data_to_uri(&self, tag_data: &str) -> Result<String, DecodeError> {
        let bytes = hex::decode(tag_data)?;

        let mut errors = Vec::with_capacity(self.decoders.len());
        for decoder in &self.decoders {
            match decoder.decode(&bytes) {
                Ok(uri) => return Ok(uri),
                Err(e) => errors.push(e.to_string()),
            }
        }
        Err(DecodeError::NoDecoder(errors.join("\n")))
    }
}
