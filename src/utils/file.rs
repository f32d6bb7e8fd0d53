use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::{Compression, GzBuilder};

use crate::config::defs::GZIP_EXT;


pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens a file, transparently decompressing gzip content.
pub fn open_reader(path: &Path) -> io::Result<FileReader> {
    let gzipped = is_gzipped(path)?;
    let file = File::open(path)?;
    if gzipped {
        Ok(FileReader::Gzipped(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(FileReader::Uncompressed(BufReader::new(file)))
    }
}

/// Zero-length files are reported as not gzipped.
pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Splits a path into its stem (without any extensions) and the extension list,
/// e.g. `S1_PE.fastq.gz` -> (`S1_PE`, ["fastq", "gz"]).
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut parts = file_name.split('.');
    let stem = parts.next().unwrap_or_default().to_string();
    let extensions: Vec<String> = parts.map(|p| p.to_string()).collect();
    let stem_path = match path.parent() {
        Some(parent) => parent.join(stem),
        None => PathBuf::from(stem),
    };
    (stem_path, extensions)
}


/// Builds `<dir>/<base><delimiter><suffix>`; a missing suffix returns `<dir>/<base>`.
pub fn file_path_manipulator(
    base: &str,
    dir: &Path,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    match suffix {
        Some(suffix) => dir.join(format!("{}{}{}", base, delimiter, suffix)),
        None => dir.join(base),
    }
}


/// Compresses `source` into `dest` at `level`. The gzip header carries no
/// name or timestamp, so identical input gives byte-identical output.
pub fn gzip_file(source: &Path, dest: &Path, level: u32) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(dest)?);
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(writer, Compression::new(level));
    let copied = io::copy(&mut reader, &mut encoder)?;
    let mut inner = encoder.finish()?;
    inner.flush()?;
    Ok(copied)
}

/// Opens a deterministic gzip writer at `dest`.
pub fn gzip_writer(dest: &Path, level: u32) -> io::Result<flate2::write::GzEncoder<BufWriter<File>>> {
    let writer = BufWriter::new(File::create(dest)?);
    Ok(GzBuilder::new().mtime(0).write(writer, Compression::new(level)))
}

/// Writes a valid gzip stream with no content.
pub fn write_empty_gz(dest: &Path, level: u32) -> io::Result<()> {
    let encoder = gzip_writer(dest, level)?;
    let mut inner = encoder.finish()?;
    inner.flush()?;
    Ok(())
}

/// Moves a staged file into place. Both paths live in the same project tree,
/// so the rename is atomic and readers never see a half-written file.
pub fn commit_file(staged: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(staged, dest)
}

/// Compresses a staged raw output straight to its final location via a
/// temporary `.part` file, then removes the raw file.
pub fn commit_compressed(raw: &Path, dest: &Path, level: u32) -> io::Result<()> {
    let part = staged_sibling(raw, "part");
    gzip_file(raw, &part, level)?;
    commit_file(&part, dest)?;
    fs::remove_file(raw)?;
    Ok(())
}

fn staged_sibling(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}", tag, GZIP_EXT));
    path.with_file_name(name)
}

pub fn file_is_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::metadata(path)?.len() == 0)
}

/// Lists regular files in `dir` whose name ends with `suffix`, sorted.
pub fn list_files_with_suffix(dir: &Path, suffix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(suffix))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_remover() {
        let (stem, exts) = extension_remover(Path::new("/data/S1_PE.fastq.gz"));
        assert_eq!(stem, PathBuf::from("/data/S1_PE"));
        assert_eq!(exts, vec!["fastq".to_string(), "gz".to_string()]);
    }

    #[test]
    fn test_gzip_is_deterministic() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let raw = dir.path().join("raw.fasta");
        fs::write(&raw, ">a;size=2\nACGT\n")?;
        let first = dir.path().join("first.fasta.gz");
        let second = dir.path().join("second.fasta.gz");
        gzip_file(&raw, &first, 6)?;
        gzip_file(&raw, &second, 6)?;
        assert_eq!(fs::read(&first)?, fs::read(&second)?);
        assert!(is_gzipped(&first)?);
        Ok(())
    }

    #[test]
    fn test_commit_compressed_removes_raw() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let raw = dir.path().join("S1.fasta");
        fs::write(&raw, ">a\nACGT\n")?;
        let dest = dir.path().join("data").join("S1.fasta.gz");
        commit_compressed(&raw, &dest, 6)?;
        assert!(dest.exists());
        assert!(!raw.exists());
        let mut content = String::new();
        open_reader(&dest)?.read_to_string(&mut content)?;
        assert_eq!(content, ">a\nACGT\n");
        Ok(())
    }

    #[test]
    fn test_empty_file_is_not_gzipped() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.fasta");
        File::create(&path)?;
        assert!(!is_gzipped(&path)?);
        assert!(file_is_empty(&path)?);
        Ok(())
    }
}
