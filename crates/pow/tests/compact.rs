use boltd_consensus::{consensus_params, Network};
use boltd_pow::difficulty::{block_proof, compact_to_target, hash_meets_target, target_to_compact};
use boltd_pow::validation::next_work_required;

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    assert_eq!(target_to_compact(&target), bits);
}

#[test]
fn regtest_limit_layout() {
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    assert!(hash_meets_target(&[0x00u8; 32], &target));
    assert!(hash_meets_target(&target, &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}

#[test]
fn network_limits_order_by_work() {
    let mainnet = consensus_params(Network::Mainnet);
    let regtest = consensus_params(Network::Regtest);
    let mainnet_proof = block_proof(mainnet.genesis_bits).expect("proof");
    let regtest_proof = block_proof(regtest.genesis_bits).expect("proof");
    assert!(mainnet_proof > regtest_proof);
}

#[test]
fn steady_interval_keeps_target() {
    let params = consensus_params(Network::Mainnet);
    let start = 1_000_000u32;
    let tip = start + params.pow_retarget_timespan as u32;
    let bits = next_work_required(
        params.pow_retarget_interval,
        0x1c0fffff,
        tip,
        start,
        &params,
    )
    .expect("bits");
    assert_eq!(bits, 0x1c0fffff);
}
