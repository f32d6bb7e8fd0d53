use seq_io::fasta::Reader as FastaReader;
use seq_io::fasta::Record;
use seq_io::fastq::Reader as FastqReader;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::config::defs::{FASTA_EXTS, FASTA_TAG, FASTQ_EXTS, FASTQ_TAG, SIZE_ANNOTATION};
use crate::utils::file::{extension_remover, open_reader, FileReader};

lazy_static! {
    static ref R1_R2_TAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("R1", "R2");
        m.insert("r1", "r2");
        m.insert("1", "2");
        m.insert("F", "R");
        m.insert("f", "r");
        m.insert("FWD", "REV");
        m.insert("fwd", "rev");
        m.insert("PE1", "PE2");
        m.insert("pe1", "pe2");
        m.insert("READ1", "READ2");
        m.insert("read1", "read2");
        m
    };
}


/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<FileReader>),
    Fastq(FastqReader<FileReader>),
}

/// Creates a SequenceReader for either FASTA or FASTQ files.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file, optionally gzipped.
///
/// # Returns
/// io::Result<SequenceReader>: Result bearing the correct SequenceReader.
///
pub fn sequence_reader(path: &Path) -> io::Result<SequenceReader> {
    let reader = open_reader(path)?;
    match fastx_filetype(path)?.as_str() {
        FASTA_TAG => Ok(SequenceReader::Fasta(FastaReader::new(reader))),
        _ => Ok(SequenceReader::Fastq(FastqReader::new(reader))),
    }
}

/// Determines FASTA vs FASTQ from the file extensions.
/// Checks extensions, not the body.
fn fastx_filetype(path: &Path) -> io::Result<String> {
    let (_, extensions) = extension_remover(path);

    for ext in &extensions {
        if FASTA_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTA_TAG.to_string());
        }

        if FASTQ_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTQ_TAG.to_string());
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "File '{}' has invalid extension(s) '{:?}'. Expected FASTA ({:?}) or FASTQ ({:?}).",
            path.display(),
            extensions,
            FASTA_EXTS,
            FASTQ_EXTS
        ),
    ))
}

fn invalid_data<E: std::fmt::Display>(path: &Path, e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", path.display(), e))
}


/// Counts the records in a FASTA or FASTQ file.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file. Zero-length files hold zero records.
///
/// # Returns
/// u64: Number of records.
///
pub fn record_counter(path: &Path) -> io::Result<u64> {
    if fs::metadata(path)?.len() == 0 {
        return Ok(0);
    }
    let mut counter = 0;
    match sequence_reader(path)? {
        SequenceReader::Fasta(mut reader) => {
            while let Some(record) = reader.next() {
                record.map_err(|e| invalid_data(path, e))?;
                counter += 1;
            }
        }
        SequenceReader::Fastq(mut reader) => {
            while let Some(record) = reader.next() {
                record.map_err(|e| invalid_data(path, e))?;
                counter += 1;
            }
        }
    }
    Ok(counter)
}

/// True when the file holds no records. Reads at most one record.
pub fn is_empty_fastx(path: &Path) -> io::Result<bool> {
    if fs::metadata(path)?.len() == 0 {
        return Ok(true);
    }
    let first = match sequence_reader(path)? {
        SequenceReader::Fasta(mut reader) => reader.next().map(|r| r.map(|_| ()).map_err(|e| invalid_data(path, e))),
        SequenceReader::Fastq(mut reader) => reader.next().map(|r| r.map(|_| ()).map_err(|e| invalid_data(path, e))),
    };
    match first {
        None => Ok(true),
        Some(record) => record.map(|_| false),
    }
}

/// True when every given file holds no records.
pub fn all_empty(paths: &[PathBuf]) -> io::Result<bool> {
    for path in paths {
        if !is_empty_fastx(path)? {
            return Ok(false);
        }
    }
    Ok(true)
}


/// One dereplicated sequence with its abundance.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedSequence {
    pub hash: String,
    pub size: u64,
    pub seq: String,
}

/// Reads the abundance from a `;size=N` header annotation; unannotated headers count once.
pub fn size_from_header(header: &str) -> u64 {
    header
        .split(SIZE_ANNOTATION)
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .and_then(|n| n.trim().parse::<u64>().ok())
        .unwrap_or(1)
}

/// Hex SHA-256 of the upper-cased sequence, used as a stable cross-sample id.
pub fn sequence_hash(seq: &str) -> String {
    format!("{:x}", Sha256::digest(seq.to_ascii_uppercase().as_bytes()))
}

/// Reads a (possibly gzipped) FASTA file into sized, hashed sequences in file order.
pub fn read_sized_fasta(path: &Path) -> io::Result<Vec<SizedSequence>> {
    let mut sequences = Vec::new();
    if fs::metadata(path)?.len() == 0 {
        return Ok(sequences);
    }
    let mut reader = FastaReader::new(open_reader(path)?);
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| invalid_data(path, e))?;
        let header = String::from_utf8_lossy(record.head()).into_owned();
        let seq = String::from_utf8_lossy(&record.full_seq()).to_ascii_uppercase();
        sequences.push(SizedSequence {
            hash: sequence_hash(&seq),
            size: size_from_header(&header),
            seq,
        });
    }
    Ok(sequences)
}

/// Collapses sequences that share a hash, summing their sizes.
pub fn collapse_by_hash(sequences: Vec<SizedSequence>) -> BTreeMap<String, SizedSequence> {
    let mut collapsed: BTreeMap<String, SizedSequence> = BTreeMap::new();
    for sequence in sequences {
        collapsed
            .entry(sequence.hash.clone())
            .and_modify(|existing| existing.size += sequence.size)
            .or_insert(sequence);
    }
    collapsed
}

pub fn total_size(sequences: &[SizedSequence]) -> u64 {
    sequences.iter().map(|s| s.size).sum()
}

/// Orders by descending size, then hash, so outputs are reproducible.
pub fn sort_by_abundance(sequences: &mut [SizedSequence]) {
    sequences.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.hash.cmp(&b.hash)));
}

pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    if let Some(desc) = desc {
        writeln!(writer, ">{} {}", id, desc)?;
    } else {
        writeln!(writer, ">{}", id)?;
    }
    writer.write_all(seq)?;
    writeln!(writer)?;
    Ok(())
}

/// Writes `>hash;size=N` records.
pub fn write_sized_fasta<W: Write>(writer: &mut W, sequences: &[SizedSequence]) -> io::Result<()> {
    for sequence in sequences {
        let id = format!("{}{}{}", sequence.hash, SIZE_ANNOTATION, sequence.size);
        write_fasta_record(writer, &id, None, sequence.seq.as_bytes())?;
    }
    Ok(())
}


const IUPAC: &[u8] = b"ACGTURYSWKMBDHVN";

pub fn is_iupac_sequence(seq: &str) -> bool {
    !seq.is_empty() && seq.bytes().all(|b| IUPAC.contains(&b.to_ascii_uppercase()))
}

/// Reverse complement with IUPAC ambiguity codes.
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => 'T',
            b'T' | b'U' => 'A',
            b'G' => 'C',
            b'C' => 'G',
            b'R' => 'Y',
            b'Y' => 'R',
            b'S' => 'S',
            b'W' => 'W',
            b'K' => 'M',
            b'M' => 'K',
            b'B' => 'V',
            b'V' => 'B',
            b'D' => 'H',
            b'H' => 'D',
            _ => 'N',
        })
        .collect()
}


#[derive(Debug, PartialEq)]
pub struct R1R2Result {
    pub delimiter: Option<char>,
    pub r1_tag: Option<String>,
    pub prefix: Option<String>,
    pub index: Option<usize>,
}

/// Locates the read-direction tag in a file name, e.g. `Lake1_A_R1.fastq.gz`
/// gives prefix `Lake1_A` and tag `R1`. Checks the name, not the body.
pub fn r1r2_base(path: &Path) -> R1R2Result {
    let none = R1R2Result {
        delimiter: None,
        r1_tag: None,
        prefix: None,
        index: None,
    };
    let (stem, _) = extension_remover(path);
    let filename = match stem.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => return none,
    };

    for delimiter in ['_', '.', '-'] {
        let parts: Vec<&str> = filename.split(delimiter).collect();
        // Scan from the end: sample names may legitimately contain "1" or "F".
        for (index, part) in parts.iter().enumerate().rev().skip_while(|(i, _)| *i == 0) {
            if R1_R2_TAGS.contains_key(part) || R1_R2_TAGS.values().any(|v| v == part) {
                return R1R2Result {
                    delimiter: Some(delimiter),
                    r1_tag: Some(part.to_string()),
                    prefix: Some(parts[..index].join(&delimiter.to_string())),
                    index: Some(index),
                };
            }
        }
    }
    none
}

/// Forward/reverse read files of one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePair {
    pub sample: String,
    pub forward: PathBuf,
    pub reverse: PathBuf,
}

/// Groups demultiplexed files into forward/reverse pairs by their shared prefix.
///
/// # Returns
/// (pairs sorted by sample, files that could not be paired)
pub fn find_file_pairs(files: &[PathBuf]) -> (Vec<FilePair>, Vec<PathBuf>) {
    let mut groups: BTreeMap<String, Vec<(String, PathBuf)>> = BTreeMap::new();
    let mut singles = Vec::new();

    for file in files {
        let result = r1r2_base(file);
        match (result.prefix, result.r1_tag) {
            (Some(prefix), Some(tag)) if !prefix.is_empty() => {
                groups.entry(prefix).or_default().push((tag, file.clone()));
            }
            _ => singles.push(file.clone()),
        }
    }

    let mut pairs = Vec::new();
    for (sample, mut members) in groups {
        if members.len() != 2 {
            singles.extend(members.into_iter().map(|(_, f)| f));
            continue;
        }
        members.sort_by(|a, b| a.0.cmp(&b.0));
        let forward_first = R1_R2_TAGS.get(members[0].0.as_str()) == Some(&members[1].0.as_str());
        let reverse_first = R1_R2_TAGS.get(members[1].0.as_str()) == Some(&members[0].0.as_str());
        if forward_first {
            pairs.push(FilePair {
                sample,
                forward: members[0].1.clone(),
                reverse: members[1].1.clone(),
            });
        } else if reverse_first {
            pairs.push(FilePair {
                sample,
                forward: members[1].1.clone(),
                reverse: members[0].1.clone(),
            });
        } else {
            singles.extend(members.into_iter().map(|(_, f)| f));
        }
    }
    (pairs, singles)
}
