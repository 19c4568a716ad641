//! FITS header reading.
//!
//! Headers are read with cfitsio through the `fitsio` crate. Remote files are
//! fetched just far enough to cover the header, spooled to a temporary file
//! and opened from there. Values are kept as [`RawValue`]s; conversion to
//! catalog types happens later.

use std::ffi::{CStr, CString};
use std::fmt;
use std::io::Write;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr;

use fitsio::errors::check_status as fits_check_status;
use fitsio::FitsFile;
use serde::Deserialize;
use thiserror::Error;

use crate::models::RawValue;

// `ffc2s` (fits_convert_string) is exported by cfitsio but declared only in
// its internal `fitsio2.h`, so fitsio-sys does not bind it.
extern "C" {
    fn ffc2s(instr: *const c_char, outstr: *mut c_char, status: *mut c_int) -> c_int;
}

/// Size of a FITS logical record.
pub const BLOCK_SIZE: usize = 2880;
/// Size of a header card image.
pub const CARD_SIZE: usize = 80;

/// cfitsio string buffers (card, keyword, value, comment) fit in this.
const FLEN_CARD: usize = 81;

const COMMENTARY_KEYWORDS: &[&str] = &["COMMENT", "HISTORY", ""];

#[derive(Debug, Error)]
pub enum FitsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Couldn't open {}: {fits_error}", fits_filename.display())]
    Open {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: PathBuf,
    },
    #[error("HDU {hdu} not found in {}: {fits_error}", fits_filename.display())]
    HduNotFound {
        hdu: HduSelector,
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: PathBuf,
    },
    #[error("{}: couldn't read header card {card}: {fits_error}", fits_filename.display())]
    Card {
        card: usize,
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: PathBuf,
    },
    #[error("{}: couldn't read the long string of {keyword}: {reason}", fits_filename.display())]
    LongString {
        keyword: String,
        reason: String,
        fits_filename: PathBuf,
    },
    #[error("header is truncated: no header bytes in the response")]
    Truncated,
    #[error("could not fetch header from {url}: {reason}")]
    Fetch { url: String, reason: String },
}

/// One parsed header card.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    pub value: RawValue,
    pub comment: Option<String>,
}

impl Card {
    pub fn is_commentary(&self) -> bool {
        COMMENTARY_KEYWORDS.contains(&self.keyword.as_str())
    }
}

/// An ordered FITS header.
///
/// Keeps the original card images so the header text can be reproduced
/// exactly, even after keywords are promoted from comments.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    cards: Vec<Card>,
    images: Vec<String>,
}

impl FitsHeader {
    /// Value of the first card with this keyword, case-insensitively.
    pub fn get(&self, keyword: &str) -> Option<&RawValue> {
        self.card(keyword).map(|c| &c.value)
    }

    pub fn card(&self, keyword: &str) -> Option<&Card> {
        let keyword = keyword.trim().to_ascii_uppercase();
        self.cards.iter().find(|c| c.keyword == keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.card(keyword).is_some()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// All COMMENT texts, in order.
    pub fn comments(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().filter_map(|c| match (&*c.keyword, &c.value) {
            ("COMMENT", RawValue::Text(text)) => Some(text.as_str()),
            _ => None,
        })
    }

    /// The header as text: card images followed by END, trailing blanks
    /// removed.
    pub fn to_header_string(&self) -> String {
        let mut out = String::with_capacity((self.images.len() + 1) * CARD_SIZE);
        for image in &self.images {
            out.push_str(&format!("{:<80}", image));
        }
        out.push_str(&format!("{:<80}", "END"));
        out.trim().to_string()
    }

    /// Turn `COMMENT KEY = value` cards into regular keywords.
    ///
    /// Spaces in the key become underscores and quotes around the value are
    /// dropped. Existing keywords are never overwritten. The header text is
    /// left untouched.
    pub fn promote_comment_keywords(&mut self) -> usize {
        let promoted: Vec<Card> = self
            .comments()
            .filter_map(|comment| {
                let (key, value) = comment.split_once('=')?;
                let key = key.trim().replace(' ', "_").to_ascii_uppercase();
                if key.is_empty() {
                    return None;
                }
                let value = value.trim().trim_matches('\'').to_string();
                Some(Card {
                    keyword: key,
                    value: RawValue::Text(value),
                    comment: None,
                })
            })
            .collect();

        let mut count = 0;
        for card in promoted {
            if !self.contains(&card.keyword) {
                self.cards.push(card);
                count += 1;
            }
        }
        count
    }
}

/// Which HDU of a file to read: by position or by `EXTNAME`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HduSelector {
    Index(usize),
    Name(String),
}

impl Default for HduSelector {
    fn default() -> Self {
        HduSelector::Index(0)
    }
}

impl fmt::Display for HduSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HduSelector::Index(i) => write!(f, "{}", i),
            HduSelector::Name(name) => write!(f, "\"{}\"", name),
        }
    }
}

impl std::str::FromStr for HduSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<usize>() {
            Ok(i) => HduSelector::Index(i),
            Err(_) => HduSelector::Name(s.trim().to_string()),
        })
    }
}

/// Read a header from a local FITS file.
pub fn read_header(path: &Path, hdu: &HduSelector) -> Result<FitsHeader, FitsError> {
    let mut fptr = FitsFile::open(path).map_err(|e| FitsError::Open {
        fits_error: Box::new(e),
        fits_filename: path.to_path_buf(),
    })?;
    let moved = match hdu {
        HduSelector::Index(i) => fptr.hdu(*i),
        HduSelector::Name(name) if name.eq_ignore_ascii_case("PRIMARY") => fptr.hdu(0),
        HduSelector::Name(name) => fptr.hdu(name.as_str()),
    };
    moved.map_err(|e| FitsError::HduNotFound {
        hdu: hdu.clone(),
        fits_error: Box::new(e),
        fits_filename: path.to_path_buf(),
    })?;
    read_current_header(&mut fptr, path)
}

fn c_buffer() -> [c_char; FLEN_CARD] {
    [0; FLEN_CARD]
}

fn from_c_buffer(buffer: &[c_char; FLEN_CARD]) -> String {
    // cfitsio always NUL-terminates and the buffers start zeroed.
    unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Read every card of the current HDU.
fn read_current_header(fptr: &mut FitsFile, path: &Path) -> Result<FitsHeader, FitsError> {
    let card_error = |card: usize, e: fitsio::errors::Error| FitsError::Card {
        card,
        fits_error: Box::new(e),
        fits_filename: path.to_path_buf(),
    };

    let mut num_cards: c_int = 0;
    let mut free_space: c_int = 0;
    let mut status = 0;
    unsafe {
        // ffghsp = fits_get_hdrspace
        fitsio_sys::ffghsp(fptr.as_raw(), &mut num_cards, &mut free_space, &mut status);
    }
    fits_check_status(status).map_err(|e| card_error(0, e))?;

    let mut header = FitsHeader::default();
    let mut in_long_string = false;
    for n in 1..=num_cards {
        let card_num = n as usize;
        let mut record = c_buffer();
        let mut keyword = c_buffer();
        let mut value = c_buffer();
        let mut comment = c_buffer();
        let mut length: c_int = 0;
        unsafe {
            // ffgrec = fits_read_record
            fitsio_sys::ffgrec(fptr.as_raw(), n, record.as_mut_ptr(), &mut status);
            // ffgknm = fits_get_keyname
            fitsio_sys::ffgknm(record.as_mut_ptr(), keyword.as_mut_ptr(), &mut length, &mut status);
        }
        fits_check_status(status).map_err(|e| card_error(card_num, e))?;

        let image = from_c_buffer(&record);
        let name = from_c_buffer(&keyword);
        let name = name
            .strip_prefix("HIERARCH ")
            .unwrap_or(&name)
            .trim()
            .to_ascii_uppercase();

        if COMMENTARY_KEYWORDS.contains(&name.as_str()) {
            let text = image.get(8..).unwrap_or("").trim_end().to_string();
            header.cards.push(Card {
                keyword: name,
                value: RawValue::Text(text),
                comment: None,
            });
            header.images.push(image);
            continue;
        }
        if name == "CONTINUE" && in_long_string {
            header.images.push(image);
            continue;
        }

        unsafe {
            // ffpsvc = fits_parse_value
            fitsio_sys::ffpsvc(
                record.as_mut_ptr(),
                value.as_mut_ptr(),
                comment.as_mut_ptr(),
                &mut status,
            );
        }
        fits_check_status(status).map_err(|e| card_error(card_num, e))?;

        let mut parsed = typed_value(&mut value).map_err(|e| card_error(card_num, e))?;
        in_long_string = matches!(&parsed, RawValue::Text(text) if text.ends_with('&'));
        if in_long_string {
            parsed = RawValue::Text(read_long_string(fptr, &name, path)?);
        }
        let comment = from_c_buffer(&comment).trim().to_string();
        header.cards.push(Card {
            keyword: name,
            value: parsed,
            comment: Some(comment).filter(|c| !c.is_empty()),
        });
        header.images.push(image);
    }
    Ok(header)
}

/// Type a value string the way cfitsio classifies it.
fn typed_value(value: &mut [c_char; FLEN_CARD]) -> Result<RawValue, fitsio::errors::Error> {
    let text = from_c_buffer(value);
    let text = text.trim();
    if text.is_empty() {
        return Ok(RawValue::Null);
    }

    let mut dtype: c_char = 0;
    let mut status = 0;
    unsafe {
        // ffdtyp = fits_get_keytype
        fitsio_sys::ffdtyp(value.as_mut_ptr(), &mut dtype, &mut status);
    }
    fits_check_status(status)?;

    Ok(match dtype as u8 {
        b'C' => {
            let mut unquoted = c_buffer();
            unsafe {
                // ffc2s = fits_convert_string: strips quotes, un-doubles them
                ffc2s(value.as_mut_ptr(), unquoted.as_mut_ptr(), &mut status);
            }
            fits_check_status(status)?;
            RawValue::Text(from_c_buffer(&unquoted).trim_end().to_string())
        }
        b'L' => RawValue::Boolean(text == "T"),
        b'I' => match text.parse::<i64>() {
            Ok(n) => RawValue::Integer(n),
            Err(_) => real_or_text(text),
        },
        b'F' => real_or_text(text),
        _ => RawValue::Text(text.to_string()),
    })
}

fn real_or_text(text: &str) -> RawValue {
    match text.replace(['D', 'd'], "E").parse::<f64>() {
        Ok(x) => RawValue::Real(x),
        Err(_) => RawValue::Text(text.to_string()),
    }
}

/// Read a string continued over CONTINUE cards.
fn read_long_string(fptr: &mut FitsFile, keyword: &str, path: &Path) -> Result<String, FitsError> {
    let long_string_error = |reason: String| FitsError::LongString {
        keyword: keyword.to_string(),
        reason,
        fits_filename: path.to_path_buf(),
    };
    let keyword_ffi = CString::new(keyword).map_err(|e| long_string_error(e.to_string()))?;
    let mut long_string_ptr = ptr::null_mut();
    let mut status = 0;
    unsafe {
        // ffgkls = fits_read_key_longstr
        fitsio_sys::ffgkls(
            fptr.as_raw(),
            keyword_ffi.as_ptr(),
            &mut long_string_ptr,
            ptr::null_mut(),
            &mut status,
        );
    }
    fits_check_status(status).map_err(|e| long_string_error(e.to_string()))?;

    let long_string = unsafe {
        let text = CStr::from_ptr(long_string_ptr).to_string_lossy().into_owned();
        // fffree = fits_free_memory
        fitsio_sys::fffree(long_string_ptr.cast(), &mut 0);
        text
    };
    Ok(long_string.trim_end().to_string())
}

/// Spool fetched header bytes to a temporary file and read its first HDU.
fn header_from_bytes(bytes: &[u8]) -> Result<FitsHeader, FitsError> {
    if bytes.is_empty() {
        return Err(FitsError::Truncated);
    }
    let mut spool = tempfile::Builder::new().suffix(".fits").tempfile()?;
    spool.write_all(bytes)?;
    let padding = bytes.len().next_multiple_of(BLOCK_SIZE) - bytes.len();
    spool.write_all(&vec![b' '; padding])?;
    spool.flush()?;
    read_header(spool.path(), &HduSelector::Index(0))
}

/// Basic authentication for web servers hosting FITS files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// How to fetch a header over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UrlHeaderOptions {
    /// Number of header bytes to fetch, a multiple of [`BLOCK_SIZE`].
    #[serde(default = "default_header_size")]
    pub header_size: usize,
    /// Offset of the header in the (decompressed) file.
    #[serde(default)]
    pub header_offset: usize,
    /// The file is gzip compressed.
    #[serde(default)]
    pub zipped: bool,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
}

fn default_header_size() -> usize {
    BLOCK_SIZE
}

impl Default for UrlHeaderOptions {
    fn default() -> Self {
        Self {
            header_size: BLOCK_SIZE,
            header_offset: 0,
            zipped: false,
            auth: None,
        }
    }
}

/// Fetch and parse the header of a remote FITS file.
///
/// Uncompressed files are fetched with a byte range. Compressed files are
/// streamed and decompressed until enough header bytes are available.
pub async fn fetch_header(
    client: &reqwest::Client,
    url: &str,
    options: &UrlHeaderOptions,
) -> Result<FitsHeader, FitsError> {
    let fetch_error = |reason: String| FitsError::Fetch {
        url: url.to_string(),
        reason,
    };
    let wanted = options.header_offset + options.header_size;

    let mut request = client.get(url);
    if !options.zipped {
        request = request.header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", options.header_offset, wanted - 1),
        );
    }
    if let Some(auth) = &options.auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    let mut response = request
        .send()
        .await
        .map_err(|e| fetch_error(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fetch_error(format!("HTTP {}", status)));
    }
    let ranged = status == reqwest::StatusCode::PARTIAL_CONTENT;

    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    let mut plain = Vec::new();
    loop {
        let have = if options.zipped {
            decoder.get_ref().len()
        } else {
            plain.len()
        };
        let target = if ranged { options.header_size } else { wanted };
        if have >= target {
            break;
        }
        match response
            .chunk()
            .await
            .map_err(|e| fetch_error(e.to_string()))?
        {
            Some(chunk) if options.zipped => decoder
                .write_all(&chunk)
                .map_err(|e| fetch_error(format!("gzip: {}", e)))?,
            Some(chunk) => plain.extend_from_slice(&chunk),
            None => break,
        }
    }

    let bytes = if options.zipped {
        decoder
            .flush()
            .map_err(|e| fetch_error(format!("gzip: {}", e)))?;
        decoder.get_ref().clone()
    } else {
        plain
    };
    let start = if ranged { 0 } else { options.header_offset };
    let end = bytes.len().min(start + options.header_size);
    let slice = bytes.get(start..end).ok_or(FitsError::Truncated)?;
    header_from_bytes(slice)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PRIMARY: [&str; 3] = [
        "SIMPLE  =                    T",
        "BITPIX  =                    8",
        "NAXIS   =                    0",
    ];

    /// Build a FITS header block from card images. A primary header
    /// preamble is added when the cards do not start one.
    pub(crate) fn header_block(cards: &[&str]) -> Vec<u8> {
        let mut out = String::new();
        let starts_hdu = cards
            .first()
            .is_some_and(|c| c.starts_with("SIMPLE") || c.starts_with("XTENSION"));
        if !starts_hdu {
            for card in PRIMARY {
                out.push_str(&format!("{:<80}", card));
            }
        }
        for card in cards {
            out.push_str(&format!("{:<80}", card));
        }
        out.push_str(&format!("{:<80}", "END"));
        let len = out.len().next_multiple_of(BLOCK_SIZE);
        let mut bytes = out.into_bytes();
        bytes.resize(len, b' ');
        bytes
    }

    /// Read a header built from card images.
    pub(crate) fn header_from_cards(cards: &[&str]) -> FitsHeader {
        header_from_bytes(&header_block(cards)).unwrap()
    }

    fn write_file(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.fits");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_common_value_types() {
        let header = header_from_cards(&[
            "SIMPLE  =                    T / conforms to FITS standard",
            "BITPIX  =                   16",
            "NAXIS   =                    0",
            "DATE-OBS= '2021-03-04T05:06:07.250' / start of observation",
            "WAVELNTH=                  174 / [Angstrom] wavelength",
            "EXPTIME =           1.5000D+01",
            "OBJECT  = 'O''Brien  '",
            "UNDEF   =                      / undefined",
            "COMMENT this is a comment",
        ]);
        assert_eq!(header.get("SIMPLE"), Some(&RawValue::Boolean(true)));
        assert_eq!(
            header.get("date-obs"),
            Some(&RawValue::Text("2021-03-04T05:06:07.250".into()))
        );
        assert_eq!(header.get("WAVELNTH"), Some(&RawValue::Integer(174)));
        assert_eq!(
            header.card("WAVELNTH").unwrap().comment.as_deref(),
            Some("[Angstrom] wavelength")
        );
        assert_eq!(header.get("EXPTIME"), Some(&RawValue::Real(15.0)));
        assert_eq!(header.get("OBJECT"), Some(&RawValue::Text("O'Brien".into())));
        assert_eq!(header.get("UNDEF"), Some(&RawValue::Null));
        assert_eq!(header.comments().collect::<Vec<_>>(), vec!["this is a comment"]);
        assert!(header.get("MISSING").is_none());
    }

    #[test]
    fn hierarch_and_continue_cards() {
        let header = header_from_cards(&[
            "HIERARCH ESO DET CHIP = 'CCD-44'",
            "LONGSTR = 'first part &'",
            "CONTINUE  'second part'",
        ]);
        assert_eq!(
            header.get("ESO DET CHIP"),
            Some(&RawValue::Text("CCD-44".into()))
        );
        assert_eq!(
            header.get("LONGSTR"),
            Some(&RawValue::Text("first part second part".into()))
        );
        assert!(!header.contains("CONTINUE"));
        assert!(header.to_header_string().contains("CONTINUE  'second part'"));
    }

    #[test]
    fn header_string_ends_with_end_card() {
        let header = header_from_cards(&PRIMARY);
        let text = header.to_header_string();
        assert!(text.starts_with("SIMPLE  ="));
        assert!(text.ends_with("END"));
        assert_eq!(text.len(), 3 * CARD_SIZE + 3);
    }

    #[test]
    fn missing_end_is_an_error() {
        let mut block = header_block(&PRIMARY);
        block.truncate(3 * CARD_SIZE);
        let (_dir, path) = write_file(&block);
        assert!(read_header(&path, &HduSelector::default()).is_err());
        assert!(matches!(header_from_bytes(&[]), Err(FitsError::Truncated)));
    }

    #[test]
    fn promotes_comment_keywords_without_overwriting() {
        let mut header = header_from_cards(&[
            "FILTER  = 'Al +1'",
            "COMMENT BLOCKS HORZ = 1",
            "COMMENT SHUTTER_CLOSE_TIME = '0.111 s'",
            "COMMENT FILTER = Clear",
            "COMMENT no assignment here",
        ]);
        let before = header.to_header_string();
        assert_eq!(header.promote_comment_keywords(), 2);
        assert_eq!(header.get("BLOCKS_HORZ"), Some(&RawValue::Text("1".into())));
        assert_eq!(
            header.get("SHUTTER_CLOSE_TIME"),
            Some(&RawValue::Text("0.111 s".into()))
        );
        assert_eq!(header.get("FILTER"), Some(&RawValue::Text("Al +1".into())));
        assert_eq!(header.to_header_string(), before);
    }

    #[test]
    fn skips_data_units_to_reach_extension() {
        let mut file = header_block(&[
            "SIMPLE  =                    T",
            "BITPIX  =                   16",
            "NAXIS   =                    2",
            "NAXIS1  =                   10",
            "NAXIS2  =                   10",
            "EXTEND  =                    T",
        ]);
        file.extend(vec![0u8; BLOCK_SIZE]);
        file.extend(header_block(&[
            "XTENSION= 'IMAGE   '",
            "BITPIX  =                  -32",
            "NAXIS   =                    0",
            "PCOUNT  =                    0",
            "GCOUNT  =                    1",
            "EXTNAME = 'EUI     '",
            "DATE-OBS= '2022-01-01T00:00:00'",
        ]));
        let (_dir, path) = write_file(&file);

        let header = read_header(&path, &HduSelector::Index(1)).unwrap();
        assert_eq!(header.get("EXTNAME"), Some(&RawValue::Text("EUI".into())));

        let by_name = read_header(&path, &HduSelector::Name("eui".into())).unwrap();
        assert!(by_name.contains("DATE-OBS"));

        let primary = read_header(&path, &HduSelector::Name("PRIMARY".into())).unwrap();
        assert_eq!(primary.get("NAXIS"), Some(&RawValue::Integer(2)));

        let missing = read_header(&path, &HduSelector::Index(2));
        assert!(matches!(missing, Err(FitsError::HduNotFound { .. })));
    }

    #[test]
    fn oversized_data_unit_is_an_error() {
        let block = header_block(&[
            "SIMPLE  =                    T",
            "BITPIX  =                   64",
            "NAXIS   =                    1",
            "NAXIS1  =  9223372036854775807",
            "EXTEND  =                    T",
        ]);
        let (_dir, path) = write_file(&block);
        assert!(read_header(&path, &HduSelector::Index(1)).is_err());
    }

    #[test]
    fn hdu_selector_from_str() {
        assert_eq!("1".parse::<HduSelector>().unwrap(), HduSelector::Index(1));
        assert_eq!(
            "COMPRESSED_IMAGE".parse::<HduSelector>().unwrap(),
            HduSelector::Name("COMPRESSED_IMAGE".into())
        );
    }

    #[test]
    fn reads_local_file() {
        let (_dir, path) = write_file(&header_block(&PRIMARY));
        let header = read_header(&path, &HduSelector::default()).unwrap();
        assert_eq!(header.get("NAXIS"), Some(&RawValue::Integer(0)));
    }
}
