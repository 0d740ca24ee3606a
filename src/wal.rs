//! Append-only persistence log
//!
//! Every state change is appended as a tagged record and synced before the
//! client hears about it. Records are an 8-byte tag followed by
//! length-prefixed fields, zero-padded to a multiple of 8 bytes:
//!
//! | tag        | fields                             |
//! |------------|------------------------------------|
//! | `AUTHAUTH` | name, salt(16), hash(32), content  |
//! | `AUTHDIFF` | name, content                      |
//! | `KVKVKVKV` | key, value                         |
//! | `KVUPDATE` | key, value                         |
//! | `KVDELETE` | key                                |
//!
//! On startup the log is replayed in order. A trailing record cut short by a
//! crash is dropped and the file truncated, as long as every length prefix
//! that reached the disk is one the server could have written. Anything else
//! malformed is an error and the file is left alone. Compaction rewrites the log as one record per user and per live
//! key, via a temporary file renamed over the original.

use crate::auth::{User, HASH_LEN, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::protocol::{field, put_field, MAX_KEY_LEN, MAX_USERNAME_LEN};
use bytes::Bytes;
use nom::{
    bytes::complete::take,
    combinator::{map_res, verify},
    error::ErrorKind,
    number::complete::le_u64,
    IResult,
};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str;
use tracing::{debug, info, warn};

const TAG_REGISTER: &[u8; 8] = b"AUTHAUTH";
const TAG_CONTENT: &[u8; 8] = b"AUTHDIFF";
const TAG_INSERT: &[u8; 8] = b"KVKVKVKV";
const TAG_UPDATE: &[u8; 8] = b"KVUPDATE";
const TAG_DELETE: &[u8; 8] = b"KVDELETE";
const TAGS: [&[u8; 8]; 5] = [TAG_REGISTER, TAG_CONTENT, TAG_INSERT, TAG_UPDATE, TAG_DELETE];

/// One logged state change
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Register {
        name: String,
        salt: [u8; SALT_LEN],
        pass_hash: [u8; HASH_LEN],
        content: Bytes,
    },
    Content {
        name: String,
        content: Bytes,
    },
    Insert {
        key: String,
        value: Bytes,
    },
    Update {
        key: String,
        value: Bytes,
    },
    Delete {
        key: String,
    },
}

impl LogRecord {
    pub fn from_user(user: &User) -> Self {
        LogRecord::Register {
            name: user.name.clone(),
            salt: user.salt,
            pass_hash: user.pass_hash,
            content: user.content.clone(),
        }
    }

    /// Encode the record, padding included
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            LogRecord::Register {
                name,
                salt,
                pass_hash,
                content,
            } => {
                out.extend_from_slice(TAG_REGISTER);
                put_field(&mut out, name.as_bytes());
                put_field(&mut out, salt);
                put_field(&mut out, pass_hash);
                put_field(&mut out, content);
            }
            LogRecord::Content { name, content } => {
                out.extend_from_slice(TAG_CONTENT);
                put_field(&mut out, name.as_bytes());
                put_field(&mut out, content);
            }
            LogRecord::Insert { key, value } => {
                out.extend_from_slice(TAG_INSERT);
                put_field(&mut out, key.as_bytes());
                put_field(&mut out, value);
            }
            LogRecord::Update { key, value } => {
                out.extend_from_slice(TAG_UPDATE);
                put_field(&mut out, key.as_bytes());
                put_field(&mut out, value);
            }
            LogRecord::Delete { key } => {
                out.extend_from_slice(TAG_DELETE);
                put_field(&mut out, key.as_bytes());
            }
        }
        out.resize(out.len() + padding(out.len()), 0);
        out
    }
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

fn string(input: &[u8]) -> IResult<&[u8], String> {
    map_res(field, |bytes: &[u8]| str::from_utf8(bytes).map(str::to_string))(input)
}

fn blob(input: &[u8]) -> IResult<&[u8], Bytes> {
    let (input, bytes) = field(input)?;
    Ok((input, Bytes::copy_from_slice(bytes)))
}

fn fixed<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
    map_res(field, |bytes: &[u8]| <[u8; N]>::try_from(bytes))(input)
}

fn record(input: &[u8]) -> IResult<&[u8], LogRecord> {
    let start = input;
    let (input, tag) = take(8usize)(input)?;
    let (input, record) = match tag {
        b"AUTHAUTH" => {
            let (input, name) = string(input)?;
            let (input, salt) = fixed::<SALT_LEN>(input)?;
            let (input, pass_hash) = fixed::<HASH_LEN>(input)?;
            let (input, content) = blob(input)?;
            let record = LogRecord::Register {
                name,
                salt,
                pass_hash,
                content,
            };
            (input, record)
        }
        b"AUTHDIFF" => {
            let (input, name) = string(input)?;
            let (input, content) = blob(input)?;
            (input, LogRecord::Content { name, content })
        }
        b"KVKVKVKV" => {
            let (input, key) = string(input)?;
            let (input, value) = blob(input)?;
            (input, LogRecord::Insert { key, value })
        }
        b"KVUPDATE" => {
            let (input, key) = string(input)?;
            let (input, value) = blob(input)?;
            (input, LogRecord::Update { key, value })
        }
        b"KVDELETE" => {
            let (input, key) = string(input)?;
            (input, LogRecord::Delete { key })
        }
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                start,
                ErrorKind::Tag,
            )))
        }
    };
    let used = start.len() - input.len();
    let (input, _) = verify(take(padding(used)), |pad: &[u8]| pad.iter().all(|b| *b == 0))(input)?;
    Ok((input, record))
}

/// Largest length each field of a `tag` record can declare
fn field_bounds(tag: &[u8], max_value: usize) -> Option<Vec<usize>> {
    let bounds = match tag {
        b"AUTHAUTH" => vec![MAX_USERNAME_LEN, SALT_LEN, HASH_LEN, max_value],
        b"AUTHDIFF" => vec![MAX_USERNAME_LEN, max_value],
        b"KVKVKVKV" | b"KVUPDATE" => vec![MAX_KEY_LEN, max_value],
        b"KVDELETE" => vec![MAX_KEY_LEN],
        _ => return None,
    };
    Some(bounds)
}

/// Whether `rest`, which ran out of input mid-record, is the start of a
/// record the server was still writing. A length prefix beyond what the
/// server accepts means the bytes were damaged instead.
fn is_torn_tail(rest: &[u8], max_value: usize) -> bool {
    if rest.len() < 8 {
        return TAGS.iter().any(|tag| tag.starts_with(rest));
    }
    let (tag, mut fields) = rest.split_at(8);
    let Some(bounds) = field_bounds(tag, max_value) else {
        return false;
    };
    for bound in bounds {
        let parsed: IResult<&[u8], u64> = le_u64(fields);
        let Ok((after, len)) = parsed else {
            return true;
        };
        if len > bound as u64 {
            return false;
        }
        let len = len as usize;
        if after.len() < len {
            return true;
        }
        fields = &after[len..];
    }
    // Only padding is missing
    true
}

/// Records read back from a log file
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<LogRecord>,
    /// Bytes dropped from a torn trailing record
    pub torn_bytes: usize,
}

/// Parse a complete log image written with values of at most `max_value`
/// bytes. A short final record is reported through `torn_bytes` rather than
/// as an error.
pub fn decode_log(mut input: &[u8], max_value: usize) -> Result<Replay> {
    let total = input.len();
    let mut records = Vec::new();
    while !input.is_empty() {
        match record(input) {
            Ok((rest, record)) => {
                records.push(record);
                input = rest;
            }
            Err(nom::Err::Error(e)) if e.code == ErrorKind::Eof => {
                if !is_torn_tail(input, max_value) {
                    return Err(VaultError::Persistence(format!(
                        "corrupt record at offset {}: field length out of range",
                        total - input.len()
                    )));
                }
                return Ok(Replay {
                    records,
                    torn_bytes: input.len(),
                });
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                return Err(VaultError::Persistence(format!(
                    "corrupt record at offset {}: {:?}",
                    total - input.len(),
                    e.code
                )));
            }
            Err(nom::Err::Incomplete(_)) => {
                return Err(VaultError::Persistence(
                    "unexpected incomplete input".to_string(),
                ));
            }
        }
    }
    Ok(Replay {
        records,
        torn_bytes: 0,
    })
}

fn persistence(path: &Path, err: std::io::Error) -> VaultError {
    VaultError::Persistence(format!("{}: {}", path.display(), err))
}

/// Durable, serialized writer for the log file
pub struct PersistenceLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl PersistenceLog {
    /// Read the log at `path`. Returns `None` if the file does not exist.
    /// A torn trailing record is cut off the file before returning.
    pub fn replay<P: AsRef<Path>>(path: P, max_value: usize) -> Result<Option<Vec<LogRecord>>> {
        let path = path.as_ref();
        let image = match fs::read(path) {
            Ok(image) => image,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence(path, e)),
        };

        let replay = decode_log(&image, max_value)?;
        if replay.torn_bytes > 0 {
            let keep = (image.len() - replay.torn_bytes) as u64;
            warn!(
                path = %path.display(),
                dropped = replay.torn_bytes,
                "Dropping torn record at end of log"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| persistence(path, e))?;
            file.set_len(keep).map_err(|e| persistence(path, e))?;
            file.sync_all().map_err(|e| persistence(path, e))?;
        }
        debug!(path = %path.display(), records = replay.records.len(), "Log replayed");
        Ok(Some(replay.records))
    }

    /// Open `path` for appending, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| persistence(path, e))
    }

    /// Append one record and sync it to disk
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let bytes = record.encode();
        let mut file = self.file.lock();
        file.write_all(&bytes)
            .and_then(|_| file.sync_data())
            .map_err(|e| persistence(&self.path, e))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .map_err(|e| persistence(&self.path, e))
    }

    /// Current size of the log file in bytes
    pub fn size(&self) -> Result<u64> {
        let file = self.file.lock();
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| persistence(&self.path, e))
    }

    /// Replace the log with `records`. The old file stays valid until the new
    /// one is fully written and synced. Returns the new size.
    pub fn compact<I>(&self, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = LogRecord>,
    {
        let mut file = self.file.lock();
        let tmp_path = self.tmp_path();

        let written = self
            .write_snapshot(&tmp_path, records)
            .map_err(|e| persistence(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| persistence(&self.path, e))?;
        sync_parent_dir(&self.path).map_err(|e| persistence(&self.path, e))?;

        *file = Self::open_append(&self.path)?;
        info!(path = %self.path.display(), bytes = written, "Log compacted");
        Ok(written)
    }

    fn write_snapshot<I>(&self, tmp_path: &Path, records: I) -> std::io::Result<u64>
    where
        I: IntoIterator<Item = LogRecord>,
    {
        let tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(tmp);
        let mut written = 0u64;
        for record in records {
            let bytes = record.encode();
            writer.write_all(&bytes)?;
            written += bytes.len() as u64;
        }
        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.sync_all()?;
        Ok(written)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX_VALUE: usize = 1024;

    fn insert(key: &str, value: &[u8]) -> LogRecord {
        LogRecord::Insert {
            key: key.to_string(),
            value: Bytes::copy_from_slice(value),
        }
    }

    #[test]
    fn test_records_are_aligned() {
        let user = User::new("alice", "pw");
        let records = vec![
            LogRecord::from_user(&user),
            LogRecord::Content {
                name: "alice".to_string(),
                content: Bytes::from_static(b"abc"),
            },
            insert("k", b"\x00\xff"),
            LogRecord::Update {
                key: "k".to_string(),
                value: Bytes::new(),
            },
            LogRecord::Delete {
                key: "k".to_string(),
            },
        ];

        let mut image = Vec::new();
        for record in &records {
            let bytes = record.encode();
            assert_eq!(bytes.len() % 8, 0, "{:?}", record);
            image.extend_from_slice(&bytes);
        }
        assert_eq!(&image[..8], b"AUTHAUTH");

        let replay = decode_log(&image, MAX_VALUE).unwrap();
        assert_eq!(replay.records, records);
        assert_eq!(replay.torn_bytes, 0);
    }

    #[test]
    fn test_torn_tail_is_reported() {
        let mut image = insert("a", b"1").encode();
        let second = insert("b", b"22").encode();
        image.extend_from_slice(&second[..second.len() - 3]);

        let replay = decode_log(&image, MAX_VALUE).unwrap();
        assert_eq!(replay.records, vec![insert("a", b"1")]);
        assert_eq!(replay.torn_bytes, second.len() - 3);
    }

    #[test]
    fn test_corruption_is_fatal() {
        let mut image = insert("a", b"1").encode();
        image.extend_from_slice(b"GARBAGE!\0\0\0\0\0\0\0\0");
        let err = decode_log(&image, MAX_VALUE).unwrap_err();
        assert!(err.is_fatal());

        // Non-zero padding
        let mut image = insert("a", b"1").encode();
        let last = image.len() - 1;
        image[last] = 7;
        assert!(decode_log(&image, MAX_VALUE).is_err());
    }

    #[test]
    fn test_damaged_length_is_not_a_torn_tail() {
        // Value length of the middle record points past the end of the file
        let mut image = insert("a", b"1").encode();
        let middle = image.len();
        image.extend_from_slice(&insert("b", b"2").encode());
        image.extend_from_slice(&insert("c", b"3").encode());
        // tag, key length, one key byte, then the value length
        let value_len_high_byte = middle + 8 + 8 + 1 + 7;
        image[value_len_high_byte] = 0x01;

        let err = decode_log(&image, MAX_VALUE).unwrap_err();
        assert!(err.is_fatal());

        // A torn record whose lengths are in range is still recoverable
        let mut image = insert("a", b"1").encode();
        let big = insert("b", &[7u8; 100]).encode();
        image.extend_from_slice(&big[..40]);
        assert_eq!(decode_log(&image, MAX_VALUE).unwrap().torn_bytes, 40);
        assert!(decode_log(&image, 50).is_err());

        // So is a partial tag, but not an unknown one
        let mut image = insert("a", b"1").encode();
        image.extend_from_slice(b"KVDE");
        assert_eq!(decode_log(&image, MAX_VALUE).unwrap().torn_bytes, 4);
        let mut image = insert("a", b"1").encode();
        image.extend_from_slice(b"ZZZZ");
        assert!(decode_log(&image, MAX_VALUE).is_err());
    }

    #[test]
    fn test_damaged_log_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("company.dir");
        let log = PersistenceLog::open(&path).unwrap();
        for key in ["a", "b", "c"] {
            log.append(&insert(key, b"v")).unwrap();
        }
        drop(log);

        let mut raw = fs::read(&path).unwrap();
        let record_len = insert("a", b"v").encode().len();
        raw[record_len + 8 + 8 + 1 + 7] = 0x80;
        fs::write(&path, &raw).unwrap();

        let err = PersistenceLog::replay(&path, MAX_VALUE).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fs::read(&path).unwrap(), raw);
    }

    #[test]
    fn test_append_replay_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("company.dir");

        assert_eq!(PersistenceLog::replay(&path, MAX_VALUE).unwrap(), None);

        let log = PersistenceLog::open(&path).unwrap();
        log.append(&insert("k1", b"v1")).unwrap();
        log.append(&insert("k2", b"v2")).unwrap();
        let whole = log.size().unwrap();
        drop(log);

        let mut raw = fs::read(&path).unwrap();
        raw.extend_from_slice(&insert("k3", b"v3").encode()[..12]);
        fs::write(&path, &raw).unwrap();

        let records = PersistenceLog::replay(&path, MAX_VALUE).unwrap().unwrap();
        assert_eq!(records, vec![insert("k1", b"v1"), insert("k2", b"v2")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), whole);

        let log = PersistenceLog::open(&path).unwrap();
        log.append(&insert("k4", b"v4")).unwrap();
        let records = PersistenceLog::replay(&path, MAX_VALUE).unwrap().unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_compact_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("company.dir");
        let log = PersistenceLog::open(&path).unwrap();
        for i in 0..10 {
            log.append(&insert("k", format!("v{}", i).as_bytes())).unwrap();
        }
        let before = log.size().unwrap();

        let size = log.compact(vec![insert("k", b"v9")]).unwrap();
        assert!(size < before);
        assert_eq!(log.size().unwrap(), size);
        assert!(!dir.path().join("company.dir.tmp").exists());

        log.append(&LogRecord::Delete {
            key: "k".to_string(),
        })
        .unwrap();
        let records = PersistenceLog::replay(&path, MAX_VALUE).unwrap().unwrap();
        assert_eq!(
            records,
            vec![
                insert("k", b"v9"),
                LogRecord::Delete {
                    key: "k".to_string()
                }
            ]
        );
    }
}
