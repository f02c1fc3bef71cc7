use vanity_commit::{search_nonce, CpuMatcher, EncodedCommit, Error, SearchConfig, Target};

pub fn run_single_core_benchmark() {
    // Runs a benchmark for performance testing. Using a single core, this does a constant
    // hash search over 2^28 nonces, which is how many a run with the default 7-digit prefix
    // expects to need.
    // Caveats:
    // * The benchmark doesn't spawn any git commands or interact with the filesystem, whereas
    //   a real run does a ~single-digit number of filesystem operations.
    // * It never uses the GPU.
    //
    // To use: run `time target/release/vanity_commit --benchmark`.
    let encoded = EncodedCommit::new(
        b"\
            tree 6f4e79123e206448f80ec73b9a53e07eb0784fef\n\
            author Foo Bar <foo@example.com> 1611912738 -0500\n\
            committer Foo Bar <foo@example.com> 1611912738 -0500\n\
            \n\
            Test commit for benchmarking performance changes\n",
    )
    .unwrap();
    let target = Target::new("000000000000000000000000000000000000000").unwrap();

    let result = search_nonce(
        &mut CpuMatcher::new(1),
        encoded.data(),
        encoded.placeholder_offset(),
        &target,
        &SearchConfig {
            stop: Some(1 << 28),
            quiet: true,
            ..SearchConfig::default()
        },
    );

    assert!(
        matches!(result, Err(Error::ExhaustedSearchSpace { .. })),
        "expected the benchmark search to come up empty, got {:?}",
        result
    );
}
