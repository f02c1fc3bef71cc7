#[cfg(feature = "opencl")]
use ocl::{
    builders::DeviceSpecifier::TypeFlags,
    flags::{DeviceType, MemFlags},
    Buffer, Context, Device, Kernel, Platform, Program, Queue,
};
use sha1::{
    compress,
    digest::{generic_array::GenericArray, BlockInput, Digest},
    Sha1,
};
use std::{
    fmt,
    ops::Range,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    thread,
};
use thiserror::Error;
use tracing::{debug, info};

/// Everything that can go wrong between reading a commit and writing its vanity replacement.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hex prefix {prefix:?}: {reason}")]
    InvalidPrefix {
        prefix: String,
        reason: &'static str,
    },

    /// The committer line could not be located or parsed. `line` is the offending line.
    #[error("unable to parse committer line {line:?}: {reason}")]
    MalformedCommit { line: String, reason: &'static str },

    #[error("invalid search range [{start:#x}, {stop:#x}) with batch width {batch_width}")]
    InvalidSearchRange {
        start: u64,
        stop: u128,
        batch_width: u64,
    },

    /// Every nonce in `[start, stop)` was tried without a match. Retry with a different start.
    #[error("unable to find a nonce matching the prefix in [{start:#x}, {stop:#x})")]
    ExhaustedSearchSpace { start: u64, stop: u128 },

    #[error("failed to initialize the hash-matching backend: {0}")]
    PrimitiveInitialization(String),

    #[error("hash-matching backend failed: {0}")]
    Primitive(String),

    #[error("expected a commit hash matching `{expected}', but got `{actual}'")]
    DigestMismatch { expected: String, actual: String },

    #[error("`git {command}` failed: {message}")]
    Git { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Number of ASCII hex digits a nonce occupies in the committer name.
pub const NONCE_LEN: usize = 16;

/// The placeholder written where the nonce will go, until one is found.
const NONCE_PLACEHOLDER: &[u8; NONCE_LEN] = b"FFFFFFFFFFFFFFFF";

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

const SHA1_BLOCK_LEN: usize = 64;

const SHA1_INITIAL_STATE: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];

type Block = GenericArray<u8, <Sha1 as BlockInput>::BlockSize>;

/// The default number of nonces handed to a matcher at once.
pub const DEFAULT_BATCH_WIDTH: u64 = 4 * 1024 * 1024;

/// Defines a desired target prefix for a commit hash.
///
/// For example, the hash prefix "deadbeef123" corresponds to the
/// following structure:
///   Target { data: [0xdeadbeef, 0x12300000, 0, 0, 0], precision_bits: 44 }
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Target {
    /// The prefix, as split into big-endian four-byte chunks.
    /// All bits beyond the length of the prefix are set to 0.
    data: [u32; 5],
    /// The number of leading hash bits that have to match `data`.
    precision_bits: u32,
}

impl Target {
    /// The length of a full SHA-1 hash in hex digits.
    pub const MAX_PREFIX_LEN: usize = 40;

    /// Creates a new target from a hex string of at most 40 characters, in either case.
    pub fn new(prefix: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidPrefix {
            prefix: prefix.to_owned(),
            reason,
        };

        if prefix.len() > Self::MAX_PREFIX_LEN {
            return Err(invalid("longer than 40 hex digits"));
        }

        // Right-padding with '0' up to 40 digits leaves the remaining nibbles at zero.
        let mut data = [0u32; 5];
        for (position, character) in prefix.chars().enumerate() {
            let nibble = character
                .to_digit(16)
                .ok_or_else(|| invalid("contains a character that is not a hex digit"))?;
            data[position / 8] |= nibble << (28 - 4 * (position % 8));
        }

        Ok(Self {
            data,
            precision_bits: 4 * prefix.len() as u32,
        })
    }

    pub fn words(&self) -> &[u32; 5] {
        &self.data
    }

    pub fn precision_bits(&self) -> u32 {
        self.precision_bits
    }

    /// Mask containing bits set to 1 if the bit at that position is specified
    /// in the prefix, and 0 otherwise.
    pub fn mask(&self) -> [u32; 5] {
        let mut mask = [0u32; 5];
        let mut remaining_bits = self.precision_bits;
        for word in mask.iter_mut() {
            let bits = Ord::min(remaining_bits, 32);
            if bits > 0 {
                *word = u32::MAX << (32 - bits);
            }
            remaining_bits -= bits;
        }
        mask
    }

    #[inline(always)]
    pub fn matches(&self, hash: &[u32; 5]) -> bool {
        hash.iter()
            .zip(&self.mask())
            .map(|(&hash_word, &mask_word)| hash_word & mask_word)
            .zip(&self.data)
            .all(|(masked_hash_word, &desired_prefix_word)| masked_hash_word == desired_prefix_word)
    }

    /// Expected number of hashes before a match, assuming SHA-1 output is uniform.
    pub fn estimated_hashes_needed(&self) -> u64 {
        2u64.saturating_pow(self.precision_bits)
    }
}

impl Default for Target {
    /// The prefix "0000000", the length git abbreviates hashes to.
    fn default() -> Self {
        Self {
            data: [0; 5],
            precision_bits: 28,
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(prefix: &str) -> Result<Self> {
        Self::new(prefix)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self
            .data
            .iter()
            .map(|word| format!("{:08x}", word))
            .collect::<String>();
        f.write_str(&digits[..self.precision_bits as usize / 4])
    }
}

/// Returns the size of a message of `len` bytes after SHA-1 preprocessing.
pub fn padded_len(len: usize) -> usize {
    if len % SHA1_BLOCK_LEN > 55 {
        (len / SHA1_BLOCK_LEN + 2) * SHA1_BLOCK_LEN
    } else {
        (len / SHA1_BLOCK_LEN + 1) * SHA1_BLOCK_LEN
    }
}

/// Appends SHA-1 finalization padding: the byte 0x80, zeros up to 56 (mod 64), and the
/// bit-length of the message as a big-endian 64-bit integer.
pub fn sha1_preprocess(data: &[u8]) -> Vec<u8> {
    let len = padded_len(data.len());
    let mut preprocessed = Vec::with_capacity(len);
    preprocessed.extend_from_slice(data);
    preprocessed.push(0x80);
    preprocessed.resize(len - 8, 0);
    preprocessed.extend(&(data.len() as u64 * 8).to_be_bytes());

    debug_assert_eq!(preprocessed.len() % SHA1_BLOCK_LEN, 0);
    preprocessed
}

/// Prepends git's object header, `"commit <length>\0"`, to a commit body.
pub fn add_commit_header(commit: &[u8]) -> Vec<u8> {
    let mut object = format!("commit {}\0", commit.len()).into_bytes();
    object.extend_from_slice(commit);
    object
}

/// Returns everything after the first null byte, or the whole input if there is none.
pub fn strip_commit_header(object: &[u8]) -> &[u8] {
    match object.iter().position(|&byte| byte == 0) {
        Some(null_index) => &object[null_index + 1..],
        None => object,
    }
}

/// Hashes a commit object using git's object encoding, without adding padding or anything else
pub fn hash_git_commit(commit: &[u8]) -> String {
    hex::encode(
        Sha1::new()
            .chain(format!("commit {}\0", commit.len()).as_bytes())
            .chain(commit)
            .finalize(),
    )
}

/// The committer metadata of a commit, as git stores it on the `committer` line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Committer {
    pub name: String,
    pub email: String,
    /// Unix timestamp and timezone offset, e.g. "1513980898 -0500".
    pub date: String,
}

impl Committer {
    const KEYWORD: &'static str = "committer ";

    /// Parses `committer NAME[ NONCE] <EMAIL> DATE`.
    ///
    /// NAME runs up to the first " <" and EMAIL up to the last "> ". A trailing space and 16
    /// uppercase hex digits on NAME is the nonce of an earlier run; it is dropped so that
    /// repeated runs don't keep growing the name.
    pub fn parse_line(line: &[u8]) -> Result<Self> {
        let malformed = |reason| Error::MalformedCommit {
            line: String::from_utf8_lossy(line).into_owned(),
            reason,
        };

        let line = std::str::from_utf8(line).map_err(|_| malformed("not valid UTF-8"))?;
        let fields = line
            .strip_prefix(Self::KEYWORD)
            .ok_or_else(|| malformed("expected the committer line right before the message"))?;
        let (name, rest) = fields
            .split_once(" <")
            .ok_or_else(|| malformed("missing \" <\" before the email"))?;
        let (email, date) = rest
            .rsplit_once("> ")
            .ok_or_else(|| malformed("missing \"> \" after the email"))?;
        if date.is_empty() {
            return Err(malformed("missing date"));
        }

        Ok(Self {
            name: strip_previous_nonce(name).to_owned(),
            email: email.to_owned(),
            date: date.to_owned(),
        })
    }
}

fn strip_previous_nonce(name: &str) -> &str {
    match name.rsplit_once(' ') {
        Some((rest, last_word))
            if last_word.len() == NONCE_LEN
                && last_word
                    .bytes()
                    .all(|byte| matches!(byte, b'0'..=b'9' | b'A'..=b'F')) =>
        {
            rest
        }
        _ => name,
    }
}

/// A nonce found by a search. Its `Display` form is the exact text spliced into the
/// committer name: 16 uppercase hex digits.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Nonce(pub u64);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0.to_be_bytes()))
    }
}

// This should be kept in sync with the OpenCL `tail_byte` implementation.
#[inline(always)]
fn nonce_digits(nonce: u64) -> [u8; NONCE_LEN] {
    let mut digits = [0u8; NONCE_LEN];
    for (position, digit) in digits.iter_mut().enumerate() {
        *digit = HEX_DIGITS[(nonce >> (60 - 4 * position)) as usize & 0xf];
    }
    digits
}

// The data that gets searched is the concatenation of all the following:
// |--- GIT COMMIT HEADER ---
// | * The ASCII string "commit "
// | * The byte-length of the "git commit" section below, as base-10 ASCII digits
// | * A null byte (0x0)
// |--- GIT COMMIT ---
// | * Every header line before the committer line, unchanged
// | * "committer ", the committer name, and a space
// | * 16 bytes of placeholder, "FFFFFFFFFFFFFFFF". This is the only part of the data that varies
// |   across SHA1 invocations; it gets replaced by the hex digits of a nonce.
// | * " <", the committer email, "> ", the committer date, and a newline
// | * The rest of the original commit (the blank line and the commit message), ending in a newline
//
// SHA1 finalization padding is not part of this buffer; `search_nonce` adds it right before
// handing the data to a matcher.
#[derive(Debug, PartialEq, Clone)]
pub struct EncodedCommit {
    data: Vec<u8>,
    /// The length of the git commit header at the start of `data`
    header_len: usize,
    /// The index of the placeholder in `data`
    placeholder_offset: usize,
    committer: Committer,
}

impl EncodedCommit {
    /// See the comment above the definition of `EncodedCommit` for the data layout.
    ///
    /// The committer line is the line right before the first blank line, which is where git
    /// puts it for unsigned commits.
    pub fn new(raw_commit: &[u8]) -> Result<Self> {
        let lines = CommitLines::split(raw_commit)?;
        let committer = Committer::parse_line(lines.committer_line())?;

        let mut prefix = lines.before_committer();
        prefix.extend_from_slice(b"committer ");
        prefix.extend_from_slice(committer.name.as_bytes());
        prefix.push(b' ');

        let mut rest = NONCE_PLACEHOLDER.to_vec();
        rest.extend_from_slice(b" <");
        rest.extend_from_slice(committer.email.as_bytes());
        rest.extend_from_slice(b"> ");
        rest.extend_from_slice(committer.date.as_bytes());
        rest.push(b'\n');
        rest.extend(lines.after_committer());

        let mut data = format!("commit {}\0", prefix.len() + rest.len()).into_bytes();
        let header_len = data.len();
        data.extend(prefix);
        let placeholder_offset = data.len();
        data.extend(rest);

        Ok(Self {
            data,
            header_len,
            placeholder_offset,
            committer,
        })
    }

    /// The full object as it gets hashed, git header included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn placeholder_offset(&self) -> usize {
        self.placeholder_offset
    }

    /// The commit body, without git's object header.
    pub fn commit(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    /// The committer as parsed from the original commit, with any earlier nonce removed.
    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    /// Replaces the placeholder with `nonce` and hashes the result.
    pub fn finalize(mut self, nonce: Nonce) -> FinalizedCommit {
        self.data[self.placeholder_offset..self.placeholder_offset + NONCE_LEN]
            .copy_from_slice(&nonce_digits(nonce.0));
        let digest = Sha1::digest(&self.data[..]);

        FinalizedCommit {
            hash: hex::encode(&digest),
            digest: digest_words(&digest),
            data: self.data,
            header_len: self.header_len,
            nonce,
            committer: self.committer,
        }
    }
}

/// A commit body split on '\n' (after dropping one trailing newline), with the committer line
/// located: the line right before the first blank line.
struct CommitLines<'a> {
    lines: Vec<&'a [u8]>,
    committer_index: usize,
}

impl<'a> CommitLines<'a> {
    fn split(raw_commit: &'a [u8]) -> Result<Self> {
        let body = raw_commit.strip_suffix(b"\n").unwrap_or(raw_commit);
        let lines = body.split(|&byte| byte == b'\n').collect::<Vec<_>>();

        let message_separator_index = lines
            .iter()
            .position(|line| line.is_empty())
            .ok_or_else(|| Error::MalformedCommit {
                line: String::new(),
                reason: "no blank line separates the headers from the message",
            })?;
        let committer_index =
            message_separator_index
                .checked_sub(1)
                .ok_or_else(|| Error::MalformedCommit {
                    line: String::new(),
                    reason: "the commit has no header lines",
                })?;

        Ok(Self {
            lines,
            committer_index,
        })
    }

    fn committer_line(&self) -> &'a [u8] {
        self.lines[self.committer_index]
    }

    /// Every line before the committer line, each followed by '\n'.
    fn before_committer(&self) -> Vec<u8> {
        let mut before = Vec::new();
        for line in &self.lines[..self.committer_index] {
            before.extend_from_slice(line);
            before.push(b'\n');
        }
        before
    }

    /// Every line after the committer line, each followed by '\n'.
    fn after_committer(&self) -> Vec<u8> {
        let mut after = Vec::new();
        for line in &self.lines[self.committer_index + 1..] {
            after.extend_from_slice(line);
            after.push(b'\n');
        }
        after
    }
}

impl Committer {
    /// Returns `raw_commit` with its committer line replaced by this committer. Every other line
    /// is kept byte for byte; the result ends in exactly one newline, like `EncodedCommit`.
    pub fn replace_in(&self, raw_commit: &[u8]) -> Result<Vec<u8>> {
        let lines = CommitLines::split(raw_commit)?;
        Committer::parse_line(lines.committer_line())?;

        let mut amended = lines.before_committer();
        amended.extend_from_slice(
            format!("committer {} <{}> {}\n", self.name, self.email, self.date).as_bytes(),
        );
        amended.extend(lines.after_committer());
        Ok(amended)
    }
}

fn digest_words(digest: &[u8]) -> [u32; 5] {
    let mut words = [0u32; 5];
    for (word, chunk) in words.iter_mut().zip(digest.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// The result of a successful search: a commit with the nonce in place.
#[derive(Debug, PartialEq, Clone)]
pub struct FinalizedCommit {
    data: Vec<u8>,
    header_len: usize,
    nonce: Nonce,
    digest: [u32; 5],
    hash: String,
    committer: Committer,
}

impl FinalizedCommit {
    /// The git commit that has the desired hash
    pub fn commit(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The hash of the commit, as a lowercase hex string
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// The committer metadata that reproduces this commit: the original name with the nonce
    /// appended, and the original email and date.
    pub fn committer(&self) -> Committer {
        Committer {
            name: format!("{} {}", self.committer.name, self.nonce),
            ..self.committer.clone()
        }
    }

    /// Checks the hash against `target`, so a faulty matcher can't slip a wrong commit through.
    pub fn verify(&self, target: &Target) -> Result<()> {
        if target.matches(&self.digest) {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: target.to_string(),
                actual: self.hash.clone(),
            })
        }
    }

    /// Hands the new committer metadata to `store`, which moves the head only if the amended
    /// commit hashes to `self.hash()`.
    pub fn write_to<S: CommitStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        store.amend_committer(&self.committer(), &self.hash)
    }
}

/// Access to the repository the commit comes from and goes back to.
pub trait CommitStore {
    /// Returns the raw body of the commit named by `rev`.
    fn read_commit(&mut self, rev: &str) -> Result<Vec<u8>>;

    /// Stores `commit` as a new commit object without touching any ref, and returns the object
    /// id the store computed for it.
    fn write_commit(&mut self, commit: &[u8]) -> Result<String>;

    /// Points the current branch at the commit `id`.
    fn update_head(&mut self, id: &str) -> Result<()>;

    /// Replaces the committer metadata of the current head commit, keeping every other byte, and
    /// moves the branch to the new commit.
    ///
    /// The head is left alone unless the stored object id is `expected_id`.
    fn amend_committer(&mut self, committer: &Committer, expected_id: &str) -> Result<()> {
        let head = self.read_commit("HEAD")?;
        let id = self.write_commit(&committer.replace_in(&head)?)?;
        if id != expected_id {
            return Err(Error::DigestMismatch {
                expected: expected_id.to_owned(),
                actual: id,
            });
        }

        debug!(%id, "moving HEAD to the amended commit");
        self.update_head(&id)
    }
}

/// A contiguous run of nonces, `[start, start + width)`, processed as one batch.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Window {
    pub start: u64,
    pub width: u64,
}

impl Window {
    /// The exclusive end. Can be 2^64, hence `u128`.
    pub fn end(&self) -> u128 {
        u128::from(self.start) + u128::from(self.width)
    }

    pub fn contains(&self, nonce: u64) -> bool {
        nonce >= self.start && u128::from(nonce) < self.end()
    }
}

/// Splits `[start, stop)` into ascending, disjoint windows of at most `batch_width` nonces.
/// Cloning restarts the sequence from wherever the clone was taken.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SearchWindows {
    next: u128,
    stop: u128,
    batch_width: u64,
}

impl SearchWindows {
    /// One past the largest nonce.
    pub const DOMAIN_END: u128 = 1 << 64;

    pub fn new(start: u64, stop: u128, batch_width: u64) -> Result<Self> {
        if u128::from(start) >= stop || stop > Self::DOMAIN_END || batch_width == 0 {
            return Err(Error::InvalidSearchRange {
                start,
                stop,
                batch_width,
            });
        }

        Ok(Self {
            next: u128::from(start),
            stop,
            batch_width,
        })
    }
}

impl Iterator for SearchWindows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.next >= self.stop {
            return None;
        }

        // Both values fit in a u64: `next < 2^64` and the width is capped by `batch_width`.
        let width = Ord::min(self.stop - self.next, u128::from(self.batch_width)) as u64;
        let window = Window {
            start: self.next as u64,
            width,
        };
        self.next += u128::from(width);
        Some(window)
    }
}

/// Tuning for a single search.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SearchConfig {
    /// The first nonce to try.
    pub start: u64,
    /// One past the last nonce to try. `None` searches to the end of the 64-bit domain.
    pub stop: Option<u64>,
    /// How many nonces to hand to the matcher at once. Smaller windows make progress reports
    /// more frequent; nothing can interrupt a window once it has started.
    pub batch_width: u64,
    /// Parallelism within a window: the OpenCL local work size, or the number of CPU threads.
    /// `None` picks the backend's default.
    pub work_size: Option<usize>,
    /// Skip the per-window progress messages.
    pub quiet: bool,
}

impl SearchConfig {
    fn stop_bound(&self) -> u128 {
        self.stop.map_or(SearchWindows::DOMAIN_END, u128::from)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            start: 0,
            stop: None,
            batch_width: DEFAULT_BATCH_WIDTH,
            work_size: None,
            quiet: false,
        }
    }
}

/// Everything a matcher needs to know about a search, fixed for all of its windows.
#[derive(Debug, Clone, Copy)]
pub struct SearchJob<'a> {
    /// The commit object with SHA1 finalization padding. The length is a multiple of 64 bytes.
    pub message: &'a [u8],
    pub target: &'a Target,
    /// Where the 16 hex digits of each candidate nonce go in `message`.
    pub placeholder_offset: usize,
}

/// A backend that can test batches of nonces against a target.
///
/// `begin` is called once per search. It sets up whatever the backend needs (buffers, compiled
/// kernels, cached hash state) and returns a session that owns it until the search ends.
pub trait HashMatcher {
    type Session: MatchSession;

    fn begin(&mut self, job: &SearchJob<'_>) -> Result<Self::Session>;
}

pub trait MatchSession {
    /// Tries every nonce in `window`. For each one, the backend writes its 16 uppercase hex
    /// digits at the placeholder, hashes the message, and compares the leading
    /// `precision_bits` bits with the target. Returns the smallest matching nonce, if any.
    fn search_window(&mut self, window: Window) -> Result<Option<u64>>;
}

/// Percentage of the expected work still left, assuming uniformly distributed hashes. Purely
/// informational: it goes negative once a search runs past the expected number of tries.
pub fn progress_estimate(window_start: u64, start: u64, precision_bits: u32) -> f64 {
    100.0 * (1.0 - window_start.saturating_sub(start) as f64 / 2f64.powi(precision_bits as i32))
}

/// Scans the nonces in `config` window by window and returns the smallest one whose commit hash
/// matches `target`.
///
/// `encoded` is the commit object with its git header, as produced by `EncodedCommit::data`, and
/// `placeholder_offset` points at its 16-byte placeholder.
pub fn search_nonce<M: HashMatcher>(
    matcher: &mut M,
    encoded: &[u8],
    placeholder_offset: usize,
    target: &Target,
    config: &SearchConfig,
) -> Result<Nonce> {
    if placeholder_offset
        .checked_add(NONCE_LEN)
        .map_or(true, |placeholder_end| placeholder_end > encoded.len())
    {
        return Err(Error::PrimitiveInitialization(format!(
            "placeholder at {} doesn't fit in a {}-byte commit",
            placeholder_offset,
            encoded.len()
        )));
    }

    let stop = config.stop_bound();
    let windows = SearchWindows::new(config.start, stop, config.batch_width)?;
    let message = sha1_preprocess(encoded);
    let mut session = matcher.begin(&SearchJob {
        message: &message,
        target,
        placeholder_offset,
    })?;

    info!(
        prefix = %target,
        expected_hashes = target.estimated_hashes_needed(),
        "searching for a matching nonce"
    );

    for (iteration, window) in windows.enumerate() {
        if !config.quiet {
            info!("Processing batch {} at {}", iteration + 1, Nonce(window.start));
            info!(
                "Estimated remaining (randomness involved) {:.6}% ...",
                progress_estimate(window.start, config.start, target.precision_bits())
            );
        }

        if let Some(nonce) = session.search_window(window)? {
            if !window.contains(nonce) {
                return Err(Error::Primitive(format!(
                    "reported nonce {} outside of the batch [{}, {:#x})",
                    Nonce(nonce),
                    Nonce(window.start),
                    window.end()
                )));
            }
            return Ok(Nonce(nonce));
        }
    }

    Err(Error::ExhaustedSearchSpace {
        start: config.start,
        stop,
    })
}

/// Searches with the fastest available backend: the GPU if the `opencl` feature is enabled and
/// one is present, otherwise all physical CPU cores.
pub fn find_nonce(encoded: &EncodedCommit, target: &Target, config: &SearchConfig) -> Result<Nonce> {
    #[cfg(feature = "opencl")]
    if OpenClMatcher::gpus_available() {
        info!("searching with OpenCL");
        let mut matcher = OpenClMatcher::new(
            config
                .work_size
                .unwrap_or(OpenClMatcher::DEFAULT_WORK_SIZE),
        );
        return search_nonce(
            &mut matcher,
            encoded.data(),
            encoded.placeholder_offset(),
            target,
            config,
        );
    }

    let mut matcher = config
        .work_size
        .map_or_else(CpuMatcher::default, CpuMatcher::new);
    info!(threads = matcher.threads, "searching with CPUs");
    search_nonce(
        &mut matcher,
        encoded.data(),
        encoded.placeholder_offset(),
        target,
        config,
    )
}

/// Splits `range` into `divisor` roughly equal parts.
fn split_range(range: Range<u64>, divisor: u64) -> impl Iterator<Item = Range<u64>> {
    let amount_per_worker = (range.end - range.start) / divisor;
    (0..divisor).map(move |index| {
        let range_start = index * amount_per_worker + range.start;
        let range_end = if index < divisor - 1 {
            range_start + amount_per_worker
        } else {
            // In case the work can't be divided perfectly, just give all the slack to the last
            // worker.
            range.end
        };
        range_start..range_end
    })
}

fn to_blocks(data: &[u8]) -> Vec<Block> {
    data.chunks_exact(SHA1_BLOCK_LEN)
        .map(Block::clone_from_slice)
        .collect()
}

/// Runs the SHA1 compression function over every block that lies wholly before the placeholder.
///
/// Those blocks are the same for every nonce, so the state vector after processing them is
/// effectively a constant for a given search. Matchers start from this state and only reprocess
/// the "dynamic blocks" from the placeholder onwards. Returns the state and the index of the first
/// dynamic block.
fn sha1_midstate(job: &SearchJob<'_>) -> ([u32; 5], usize) {
    let num_static_blocks = job.placeholder_offset / SHA1_BLOCK_LEN;
    let mut intermediate_sha1_state = SHA1_INITIAL_STATE;
    compress(
        &mut intermediate_sha1_state,
        &to_blocks(&job.message[..num_static_blocks * SHA1_BLOCK_LEN]),
    );
    (intermediate_sha1_state, num_static_blocks)
}

/// A matcher that splits each window across CPU threads.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CpuMatcher {
    threads: usize,
}

impl CpuMatcher {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: Ord::max(threads, 1),
        }
    }
}

impl Default for CpuMatcher {
    /// One thread per physical core.
    fn default() -> Self {
        Self::new(num_cpus::get_physical())
    }
}

impl HashMatcher for CpuMatcher {
    type Session = CpuSession;

    fn begin(&mut self, job: &SearchJob<'_>) -> Result<CpuSession> {
        if job.message.len() % SHA1_BLOCK_LEN != 0 {
            return Err(Error::PrimitiveInitialization(format!(
                "message length {} is not a multiple of the SHA1 block size",
                job.message.len()
            )));
        }

        let (intermediate_sha1_state, num_static_blocks) = sha1_midstate(job);
        let dynamic_blocks = to_blocks(&job.message[num_static_blocks * SHA1_BLOCK_LEN..]);
        debug!(
            num_static_blocks,
            num_dynamic_blocks = dynamic_blocks.len(),
            threads = self.threads,
            "cached SHA1 state for the CPU matcher"
        );

        Ok(CpuSession {
            target: job.target.clone(),
            intermediate_sha1_state,
            dynamic_blocks,
            placeholder_offset: job.placeholder_offset - num_static_blocks * SHA1_BLOCK_LEN,
            threads: self.threads as u64,
        })
    }
}

/// How often a CPU thread checks whether another thread already found a lower match.
const LAME_DUCK_CHECK_INTERVAL: u64 = 1 << 16;

/// The per-search state of a `CpuMatcher`.
#[derive(Debug)]
pub struct CpuSession {
    target: Target,
    intermediate_sha1_state: [u32; 5],
    dynamic_blocks: Vec<Block>,
    /// The placeholder's offset from the start of the first dynamic block. The placeholder may
    /// straddle two blocks.
    placeholder_offset: usize,
    threads: u64,
}

impl CpuSession {
    #[inline(always)]
    fn scatter_nonce(&self, dynamic_blocks: &mut [Block], nonce: u64) {
        for (position, &digit) in nonce_digits(nonce).iter().enumerate() {
            let index = self.placeholder_offset + position;
            dynamic_blocks[index / SHA1_BLOCK_LEN][index % SHA1_BLOCK_LEN] = digit;
        }
    }

    #[inline(always)]
    fn current_hash(&self, dynamic_blocks: &[Block]) -> [u32; 5] {
        let mut sha1_hash = self.intermediate_sha1_state;
        compress(&mut sha1_hash, dynamic_blocks);
        sha1_hash
    }

    /// Scans `window_start + indices` in ascending order. Records the first match in
    /// `lowest_match` and stops early once some other thread has recorded a lower index.
    fn search_indices(&self, window_start: u64, indices: Range<u64>, lowest_match: &AtomicU64) {
        let mut dynamic_blocks = self.dynamic_blocks.clone();
        let mut interval_start = indices.start;

        while interval_start < indices.end {
            if lowest_match.load(Ordering::Relaxed) < interval_start {
                return;
            }

            let interval_end = Ord::min(
                indices.end,
                interval_start.saturating_add(LAME_DUCK_CHECK_INTERVAL),
            );
            for index in interval_start..interval_end {
                self.scatter_nonce(&mut dynamic_blocks, window_start + index);
                if self.target.matches(&self.current_hash(&dynamic_blocks)) {
                    lowest_match.fetch_min(index, Ordering::Relaxed);
                    return;
                }
            }
            interval_start = interval_end;
        }
    }
}

impl MatchSession for CpuSession {
    fn search_window(&mut self, window: Window) -> Result<Option<u64>> {
        // Indices are offsets into the window. A window is at most `u64::MAX` wide, so the largest
        // index is `u64::MAX - 1` and `u64::MAX` can mean "no match yet".
        if window.width == 0 {
            return Ok(None);
        }

        let lowest_match = AtomicU64::new(u64::MAX);
        let divisor = Ord::min(self.threads, window.width);
        let session = &*self;

        thread::scope(|scope| {
            for indices in split_range(0..window.width, divisor) {
                let lowest_match = &lowest_match;
                scope.spawn(move || session.search_indices(window.start, indices, lowest_match));
            }
        });

        Ok(match lowest_match.into_inner() {
            u64::MAX => None,
            index => Some(window.start + index),
        })
    }
}

/// A matcher that runs `sha1_prefix_search.cl` on the first GPU.
#[cfg(feature = "opencl")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenClMatcher {
    work_size: usize,
}

#[cfg(feature = "opencl")]
impl OpenClMatcher {
    pub const DEFAULT_WORK_SIZE: usize = 256;

    pub fn new(work_size: usize) -> Self {
        Self {
            work_size: Ord::max(work_size, 1),
        }
    }

    pub fn gpus_available() -> bool {
        Platform::first().is_ok()
            && TypeFlags(DeviceType::GPU)
                .to_device_list(None::<Platform>)
                .map_or(false, |devices| !devices.is_empty())
    }

    fn build_session(&self, device: Device, job: &SearchJob<'_>) -> ocl::Result<OpenClSession> {
        let (intermediate_sha1_state, num_static_blocks) = sha1_midstate(job);
        let dynamic_data = &job.message[num_static_blocks * SHA1_BLOCK_LEN..];

        let context = Context::builder().devices(device).build()?;
        let queue = Queue::new(&context, device, None)?;

        let midstate = Buffer::builder()
            .queue(queue.clone())
            .len(intermediate_sha1_state.len())
            .flags(MemFlags::READ_ONLY)
            .copy_host_slice(&intermediate_sha1_state[..])
            .build()?;
        let message = Buffer::builder()
            .queue(queue.clone())
            .len(dynamic_data.len())
            .flags(MemFlags::READ_ONLY)
            .copy_host_slice(dynamic_data)
            .build()?;
        let target = Buffer::builder()
            .queue(queue.clone())
            .len(job.target.words().len())
            .flags(MemFlags::READ_ONLY)
            .copy_host_slice(&job.target.words()[..])
            .build()?;
        let match_index = Buffer::builder()
            .queue(queue.clone())
            .len(1)
            .flags(MemFlags::READ_WRITE)
            .copy_host_slice(&[u32::MAX][..])
            .build()?;

        let kernel = Kernel::builder()
            .name("sha1_prefix_search")
            .program(
                &Program::builder()
                    .src(include_str!("sha1_prefix_search.cl"))
                    .cmplr_opt("-Werror")
                    .build(&context)?,
            )
            .arg(&midstate)
            .arg(&message)
            .arg(dynamic_data.len() as u32)
            .arg(&target)
            .arg(job.target.precision_bits())
            .arg((job.placeholder_offset - num_static_blocks * SHA1_BLOCK_LEN) as u32)
            .arg_named("window_start", 0u64)
            .arg_named("window_width", 0u32)
            .arg(&match_index)
            .queue(queue)
            .global_work_size(self.work_size)
            .build()?;

        Ok(OpenClSession {
            kernel,
            match_index,
            _midstate: midstate,
            _message: message,
            _target: target,
            work_size: self.work_size as u64,
        })
    }
}

#[cfg(feature = "opencl")]
impl HashMatcher for OpenClMatcher {
    type Session = OpenClSession;

    fn begin(&mut self, job: &SearchJob<'_>) -> Result<OpenClSession> {
        let initialization_error = |error: ocl::Error| Error::PrimitiveInitialization(error.to_string());

        let device = TypeFlags(DeviceType::GPU)
            .to_device_list(Some(Platform::default()))
            .map_err(initialization_error)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::PrimitiveInitialization("no OpenCL GPU found".to_owned()))?;
        debug!(device = ?device.name(), work_size = self.work_size, "building OpenCL kernel");

        self.build_session(device, job).map_err(initialization_error)
    }
}

/// The per-search state of an `OpenClMatcher`. The device buffers live as long as the session.
#[cfg(feature = "opencl")]
#[derive(Debug)]
pub struct OpenClSession {
    kernel: Kernel,
    match_index: Buffer<u32>,
    _midstate: Buffer<u32>,
    _message: Buffer<u8>,
    _target: Buffer<u32>,
    work_size: u64,
}

#[cfg(feature = "opencl")]
impl OpenClSession {
    fn search_window_on_device(&mut self, window: Window) -> ocl::Result<Option<u64>> {
        // The kernel reports matches as a u32 offset, with u32::MAX meaning "no match", so large
        // windows go to the device in several launches.
        let max_launch_width = u64::from(u32::MAX) / self.work_size * self.work_size;
        let mut launch_offset = 0;

        while launch_offset < window.width {
            let launch_start = window.start + launch_offset;
            let launch_width = Ord::min(window.width - launch_offset, max_launch_width);
            let global_work_size =
                (launch_width + self.work_size - 1) / self.work_size * self.work_size;

            let mut match_index_host_handle = [u32::MAX];
            self.match_index
                .write(&match_index_host_handle[..])
                .enq()?;
            self.kernel.set_arg("window_start", launch_start)?;
            self.kernel.set_arg("window_width", launch_width as u32)?;

            // SAFETY: The OpenCL sha1 script is optimistically assumed to have no memory safety issues
            unsafe {
                self.kernel
                    .cmd()
                    .global_work_size(global_work_size as usize)
                    .local_work_size(self.work_size as usize)
                    .enq()?;
            }

            self.match_index
                .read(&mut match_index_host_handle[..])
                .enq()?;

            if match_index_host_handle[0] != u32::MAX {
                return Ok(Some(launch_start + u64::from(match_index_host_handle[0])));
            }
            launch_offset += launch_width;
        }

        Ok(None)
    }
}

#[cfg(feature = "opencl")]
impl MatchSession for OpenClSession {
    fn search_window(&mut self, window: Window) -> Result<Option<u64>> {
        self.search_window_on_device(window)
            .map_err(|error| Error::Primitive(error.to_string()))
    }
}
