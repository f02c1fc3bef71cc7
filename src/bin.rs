mod benchmark;

use clap::Parser;
use std::{
    io::Write,
    process::{exit, Command, Stdio},
};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vanity_commit::{
    find_nonce, hash_git_commit, search_nonce, CommitStore, CpuMatcher, EncodedCommit, Error,
    Result, SearchConfig, Target, DEFAULT_BATCH_WIDTH,
};

/// Create vanity commit hashes by extending the committer name.
#[derive(Parser, Debug)]
#[command(name = "vanity_commit", version)]
#[command(about = "Create vanity commit hashes by extending the committer name")]
struct Args {
    /// The desired hex prefix of the commit hash
    #[arg(value_parser = Target::new, required_unless_present = "benchmark")]
    hex_prefix: Option<Target>,

    /// Start the search from this nonce (hex)
    #[arg(short, long, default_value = "0", value_parser = parse_hex_nonce, env = "VANITY_COMMIT_START")]
    start: u64,

    /// Number of nonces per batch (OpenCL global size)
    #[arg(short = 'g', long = "global-size", default_value_t = DEFAULT_BATCH_WIDTH, env = "VANITY_COMMIT_GLOBAL_SIZE")]
    global_size: u64,

    /// Parallelism within a batch: the OpenCL work size (64, 128, 256, ...), or the number of
    /// threads for the CPU search
    #[arg(short = 'w', long = "work-size", env = "VANITY_COMMIT_WORK_SIZE")]
    work_size: Option<usize>,

    /// Enable writing to the repo
    #[arg(short = 'W', long = "write")]
    write: bool,

    /// Quiet mode, disables progress
    #[arg(short, long)]
    quiet: bool,

    /// Search on the CPU even if a GPU is available
    #[arg(long)]
    cpu: bool,

    /// Run a single-core benchmark instead of touching the repository
    #[arg(long, exclusive = true)]
    benchmark: bool,
}

fn parse_hex_nonce(value: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
}

fn main() {
    let args = Args::parse();
    init_tracing(args.quiet);

    if args.benchmark {
        benchmark::run_single_core_benchmark();
        return;
    }

    if let Err(error) = run_vanity_commit(&args) {
        eprintln!("{}", error);
        exit(1)
    }
}

fn init_tracing(quiet: bool) {
    let default_directive = if quiet {
        "vanity_commit=warn"
    } else {
        "vanity_commit=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_vanity_commit(args: &Args) -> Result<()> {
    let target = args.hex_prefix.clone().unwrap_or_default();
    let mut repository = GitRepository;

    let current_commit = repository.read_commit("HEAD")?;
    let encoded = EncodedCommit::new(&current_commit)?;

    println!(
        "Attempting to find sha1 prefix `{}'\nfor commit `{}'\n================\n{}================\n",
        target,
        hash_git_commit(&current_commit),
        String::from_utf8_lossy(&current_commit),
    );

    let config = SearchConfig {
        start: args.start,
        stop: None,
        batch_width: args.global_size,
        work_size: args.work_size,
        quiet: args.quiet,
    };
    let nonce = if args.cpu {
        search_nonce(
            &mut config
                .work_size
                .map_or_else(CpuMatcher::default, CpuMatcher::new),
            encoded.data(),
            encoded.placeholder_offset(),
            &target,
            &config,
        )?
    } else {
        find_nonce(&encoded, &target, &config)?
    };

    let finalized = encoded.finalize(nonce);
    finalized.verify(&target)?;

    println!(
        "\nFound sha1 prefix `{}'\nwith sha1 `{}'\nUsing {}\n================\n{}================\n",
        target,
        finalized.hash(),
        nonce,
        String::from_utf8_lossy(finalized.commit()),
    );

    if !args.write {
        println!("Changes not written to the repository.");
        return Ok(());
    }

    println!("Writing changes to the repository...\n");
    println!("{}", finalized.committer().name);
    finalized.write_to(&mut repository)?;

    println!("HEAD is now {}\nAll done.", finalized.hash());
    Ok(())
}

/// The repository in the current directory, driven through the `git` binary.
struct GitRepository;

impl CommitStore for GitRepository {
    fn read_commit(&mut self, rev: &str) -> Result<Vec<u8>> {
        spawn_git(&["cat-file", "commit", rev], None)
    }

    fn write_commit(&mut self, commit: &[u8]) -> Result<String> {
        let output = spawn_git(&["hash-object", "-t", "commit", "-w", "--stdin"], Some(commit))?;
        Ok(String::from_utf8_lossy(&output).trim().to_owned())
    }

    fn update_head(&mut self, id: &str) -> Result<()> {
        // `--soft` leaves the index and working tree alone; the tree is unchanged anyway.
        spawn_git(&["reset", "--soft", id], None)?;
        Ok(())
    }
}

fn spawn_git(args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
    debug!(?args, "running git");
    let mut child = Command::new("git")
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;
    if let (Some(input), Some(child_stdin)) = (stdin, child.stdin.as_mut()) {
        child_stdin.write_all(input)?;
    }

    let output = child.wait_with_output()?;

    if !output.status.success() {
        return Err(Error::Git {
            command: args.join(" "),
            message: output.status.to_string(),
        });
    }

    Ok(output.stdout)
}
