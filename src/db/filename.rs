//! Database file naming.
//!
//! Everything under the database directory is one of:
//!
//! ```text
//! CURRENT            points at the live manifest
//! LOCK               exclusive-open sentinel
//! LOG, LOG.old       info logs from older builds (cleaned up only)
//! MANIFEST-<n>       version-edit log
//! <n>.log            write-ahead log
//! <n>.ldb            table file (.sst accepted on read)
//! <n>.dbtmp          in-progress output
//! ```
//!
//! `<n>` is the decimal file number with no padding.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    DbLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{number}.log"))
}

pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{number}.ldb"))
}

pub fn sst_table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{number}.sst"))
}

pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("MANIFEST-{number}"))
}

pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{number}.dbtmp"))
}

/// Classifies a directory entry name. Returns `(number, type)`; the
/// number is zero for the singleton files.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    if name == "CURRENT" {
        return Some((0, FileType::Current));
    }
    if name == "LOCK" {
        return Some((0, FileType::DbLock));
    }
    if name == "LOG" || name == "LOG.old" {
        return Some((0, FileType::InfoLog));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = parse_decimal(rest)?;
        return Some((number, FileType::Descriptor));
    }

    let dot = name.find('.')?;
    let number = parse_decimal(&name[..dot])?;
    let file_type = match &name[dot..] {
        ".log" => FileType::Log,
        ".ldb" | ".sst" => FileType::Table,
        ".dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, file_type))
}

fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        // Reject padding so formatting round-trips.
        return None;
    }
    s.parse::<u64>().ok()
}

/// Points `CURRENT` at `MANIFEST-<descriptor_number>` atomically via a
/// temp file and rename.
pub fn set_current_file(
    env: &dyn crate::env::Env,
    dbname: &Path,
    descriptor_number: u64,
) -> crate::error::Result<()> {
    let manifest = descriptor_file_name(dbname, descriptor_number);
    let contents = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .expect("manifest name is valid utf-8")
        .to_string();
    let tmp = temp_file_name(dbname, descriptor_number);
    let result = crate::env::write_string_to_file_sync(env, &format!("{contents}\n"), &tmp)
        .and_then(|_| env.rename_file(&tmp, &current_file_name(dbname)));
    if result.is_err() {
        let _ = env.remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recognized_names() {
        let cases: &[(&str, u64, FileType)] = &[
            ("100.log", 100, FileType::Log),
            ("0.log", 0, FileType::Log),
            ("0.sst", 0, FileType::Table),
            ("0.ldb", 0, FileType::Table),
            ("CURRENT", 0, FileType::Current),
            ("LOCK", 0, FileType::DbLock),
            ("MANIFEST-2", 2, FileType::Descriptor),
            ("MANIFEST-7", 7, FileType::Descriptor),
            ("LOG", 0, FileType::InfoLog),
            ("LOG.old", 0, FileType::InfoLog),
            ("18446744073709551615.log", u64::MAX, FileType::Log),
            ("1.dbtmp", 1, FileType::Temp),
        ];
        for (name, number, file_type) in cases {
            let (n, t) = parse_file_name(name).unwrap_or_else(|| panic!("failed on {name}"));
            assert_eq!(n, *number, "{name}");
            assert_eq!(t, *file_type, "{name}");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for name in [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "manifest-3",
            "CURRENT.new",
            "MANIFEST",
            "MANIFEST-",
            "MANIFEST-abc",
            "MANIFEST-01",
            "100",
            "100.",
            "100.unknown",
            "18446744073709551616.log",
            "184467440737095516150.log",
        ] {
            assert!(parse_file_name(name).is_none(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_construction_round_trips() {
        let dir = Path::new("dbdir");

        let name = |p: PathBuf| p.file_name().unwrap().to_str().unwrap().to_string();

        assert_eq!(
            parse_file_name(&name(log_file_name(dir, 192))),
            Some((192, FileType::Log))
        );
        assert_eq!(
            parse_file_name(&name(table_file_name(dir, 200))),
            Some((200, FileType::Table))
        );
        assert_eq!(
            parse_file_name(&name(descriptor_file_name(dir, 100))),
            Some((100, FileType::Descriptor))
        );
        assert_eq!(
            parse_file_name(&name(current_file_name(dir))),
            Some((0, FileType::Current))
        );
        assert_eq!(
            parse_file_name(&name(lock_file_name(dir))),
            Some((0, FileType::DbLock))
        );
        assert_eq!(
            parse_file_name(&name(temp_file_name(dir, 999))),
            Some((999, FileType::Temp))
        );
    }
}
