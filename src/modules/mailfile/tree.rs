//! Directory-tree containers: Maildir (cur/new/tmp) and MH (numbered
//! files). Trees travel zipped; the importer extracts them into a tempdir
//! before walking.

use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::raise_error;
use std::io::{Read, Write};
use std::path::Path;

/// Reads every message file of a Maildir tree (`cur` and `new`).
pub fn read_maildir(root: &Path) -> MailVaultResult<Vec<Vec<u8>>> {
    let cur = root.join("cur");
    let new = root.join("new");
    if !cur.is_dir() || !new.is_dir() {
        return Err(raise_error!(
            "The given file is not a valid maildir.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut messages = Vec::new();
    for dir in [new, cur] {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        entries.sort();
        for path in entries {
            let bytes = std::fs::read(&path)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            messages.push(bytes);
        }
    }
    Ok(messages)
}

/// Writes messages as a fresh Maildir tree under `root`.
pub fn write_maildir(root: &Path, messages: &[Vec<u8>]) -> MailVaultResult<()> {
    for subdir in ["cur", "new", "tmp"] {
        std::fs::create_dir_all(root.join(subdir))
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    }
    for (index, message) in messages.iter().enumerate() {
        // Unique-enough names for an export tree; real deliveries would use
        // timestamp.pid.host.
        let name = format!("{}.mailvault.{}", index + 1, messages.len());
        std::fs::write(root.join("new").join(name), message)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    }
    Ok(())
}

/// Reads every numbered message file of an MH folder.
pub fn read_mh(root: &Path) -> MailVaultResult<Vec<Vec<u8>>> {
    if !root.is_dir() {
        return Err(raise_error!(
            "The given file is not a valid MH folder.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut numbered: Vec<(u32, std::path::PathBuf)> = std::fs::read_dir(root)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            let number = path.file_name()?.to_str()?.parse::<u32>().ok()?;
            path.is_file().then_some((number, path))
        })
        .collect();
    if numbered.is_empty() {
        // .mh_sequences alone is not a folder with mail in it.
        let has_sequences = root.join(".mh_sequences").exists();
        if !has_sequences {
            return Err(raise_error!(
                "The given file is not a valid MH folder.".into(),
                ErrorCode::InvalidParameter
            ));
        }
    }
    numbered.sort_by_key(|(number, _)| *number);
    numbered
        .into_iter()
        .map(|(_, path)| {
            std::fs::read(&path)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))
        })
        .collect()
}

/// Writes messages as an MH folder under `root`.
pub fn write_mh(root: &Path, messages: &[Vec<u8>]) -> MailVaultResult<()> {
    std::fs::create_dir_all(root)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    std::fs::write(root.join(".mh_sequences"), b"")
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    for (index, message) in messages.iter().enumerate() {
        std::fs::write(root.join((index + 1).to_string()), message)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    }
    Ok(())
}

/// Unpacks a zip payload into `target`. A corrupt archive fails the whole
/// request.
pub fn extract_zip(data: &[u8], target: &Path) -> MailVaultResult<()> {
    let reader = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
        raise_error!(
            format!("The given file is not a valid zip: {}", e),
            ErrorCode::InvalidParameter
        )
    })?;
    archive.extract(target).map_err(|e| {
        raise_error!(
            format!("Failed to extract zip archive: {}", e),
            ErrorCode::InvalidParameter
        )
    })
}

/// Reads the raw contents of every file entry in a zip payload, in archive
/// order.
pub fn zip_entries(data: &[u8]) -> MailVaultResult<Vec<(String, Vec<u8>)>> {
    let reader = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
        raise_error!(
            format!("The given file is not a valid zip: {}", e),
            ErrorCode::InvalidParameter
        )
    })?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(|e| {
            raise_error!(
                format!("Failed to read zip entry: {}", e),
                ErrorCode::InvalidParameter
            )
        })?;
        if file.is_dir() {
            continue;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        entries.push((file.name().to_string(), contents));
    }
    Ok(entries)
}

/// Packs a directory tree into a zip archive written to `writer`.
pub fn zip_directory<W: Write + std::io::Seek>(
    root: &Path,
    writer: W,
) -> MailVaultResult<()> {
    let mut zip_writer = zip::ZipWriter::new(writer);
    let options: zip::write::SimpleFileOptions = Default::default();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .to_string_lossy()
                .replace('\\', "/");
            if path.is_dir() {
                zip_writer
                    .add_directory(relative, options)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                stack.push(path);
            } else {
                zip_writer
                    .start_file(relative, options)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                let contents = std::fs::read(&path)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                zip_writer
                    .write_all(&contents)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }
        }
    }
    zip_writer
        .finish()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u8) -> Vec<u8> {
        format!("Message-ID: <t{id}@e.test>\n\nbody {id}\n").into_bytes()
    }

    #[test]
    fn test_maildir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let messages = vec![sample(1), sample(2)];
        write_maildir(dir.path(), &messages).unwrap();
        let recovered = read_maildir(dir.path()).unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.contains(&messages[0]));
        assert!(recovered.contains(&messages[1]));
    }

    #[test]
    fn test_maildir_requires_cur_and_new() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_maildir(dir.path()).is_err());
    }

    #[test]
    fn test_mh_round_trip_keeps_number_order() {
        let dir = tempfile::tempdir().unwrap();
        let messages = vec![sample(1), sample(2), sample(3)];
        write_mh(dir.path(), &messages).unwrap();
        let recovered = read_mh(dir.path()).unwrap();
        assert_eq!(recovered, messages);
    }

    #[test]
    fn test_zip_round_trip_of_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_mh(dir.path(), &[sample(1)]).unwrap();

        let mut buffer = std::io::Cursor::new(Vec::new());
        zip_directory(dir.path(), &mut buffer).unwrap();

        let target = tempfile::tempdir().unwrap();
        extract_zip(buffer.get_ref(), target.path()).unwrap();
        let recovered = read_mh(target.path()).unwrap();
        assert_eq!(recovered, vec![sample(1)]);
    }

    #[test]
    fn test_extract_zip_rejects_garbage() {
        let target = tempfile::tempdir().unwrap();
        assert!(extract_zip(b"definitely not a zip", target.path()).is_err());
    }
}
