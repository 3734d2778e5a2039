//! State engine tests: genesis bootstrap, apply/undo restoration, index
//! density and persistence across restarts.

use crate::generators::{build_spend_tx, TestWallet};
use crate::harness::{assert_dense_output_buckets, TestChain, TEST_GENESIS_TIME};
use nacre_chain::{AddTransactionResult, BlockAddResult, ChainConfig, ChainState, UtxoRead};
use nacre_currency::params;
use nacre_primitives::TransactionInput;

// ============ Genesis Bootstrap Tests ============

#[test]
fn test_genesis_bootstrap() {
    let mut harness = TestChain::new();
    let chain = &harness.chain;

    assert_eq!(chain.tip_height(), 0);
    assert_eq!(chain.tip().hash, chain.currency().genesis_block_hash);
    // Genesis cumulative difficulty equals its own difficulty.
    assert_eq!(chain.tip().difficulty, 1);
    assert_eq!(chain.tip().cumulative_difficulty, 1);

    // Every amount emitted by the genesis coinbase has outputs indexed.
    let genesis = chain.currency().genesis_block();
    assert!(!genesis.header.base_transaction.prefix.outputs.is_empty());
    for output in &genesis.header.base_transaction.prefix.outputs {
        assert!(
            chain.next_global_index_for_amount(output.amount) > 0,
            "amount {} missing from the index",
            output.amount
        );
    }

    // The per-block index vector covers exactly the coinbase.
    let indices = chain
        .read_block_output_global_indices(&chain.currency().genesis_block_hash)
        .unwrap();
    assert_eq!(indices.len(), 1);
    assert_eq!(
        indices[0].len(),
        genesis.header.base_transaction.prefix.outputs.len()
    );

    assert_dense_output_buckets(&mut harness);
}

#[test]
fn test_genesis_wallet_owns_coinbase() {
    let harness = TestChain::new();
    let mut wallet = TestWallet::genesis_wallet();
    let genesis_hash = harness.chain.currency().genesis_block_hash;
    wallet.scan_block(&harness.chain, &genesis_hash);
    let genesis = harness.chain.currency().genesis_block();
    assert_eq!(
        wallet.owned.len(),
        genesis.header.base_transaction.prefix.outputs.len()
    );
}

// ============ Apply / Undo Restoration Tests ============

#[test]
fn test_apply_undo_restores_byte_image() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW - 1);

    let mut wallet = TestWallet::genesis_wallet();
    wallet.scan_block(&harness.chain, &harness.chain.currency().genesis_block_hash);
    let source = wallet.find_output(6_000_000).unwrap();

    let image_before = harness.state_image();

    // A spend creating a brand-new amount bucket (7).
    let (tid, tx, binary) = build_spend_tx(
        &[source.clone()],
        &[7, 5_999_993],
        &wallet,
        0,
    );
    let now = harness.clock.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(
        harness.chain.add_transaction(tid, tx, binary, now),
        AddTransactionResult::BroadcastAll
    );
    let (summary, raw_block) = harness.mine_block();

    assert!(harness.chain.read_amount_output(7, 0).is_some());
    assert_eq!(harness.chain.next_global_index_for_amount(7), 1);
    assert_eq!(
        harness.chain.read_keyimage(&source.key_image()),
        Some(summary.height)
    );
    let image_applied = harness.state_image();
    assert_ne!(image_before, image_applied);
    assert_dense_output_buckets(&mut harness);

    // Undo restores the exact byte image.
    harness.chain.undo_tip_block().unwrap();
    assert!(harness.chain.read_amount_output(7, 0).is_none());
    assert_eq!(harness.chain.next_global_index_for_amount(7), 0);
    assert_eq!(harness.chain.read_keyimage(&source.key_image()), None);
    assert_eq!(harness.state_image(), image_before);
    assert_dense_output_buckets(&mut harness);

    // Re-applying the identical block restores the applied image.
    match harness.chain.add_block(raw_block).unwrap() {
        BlockAddResult::Accepted(info) => assert_eq!(info.hash, summary.hash),
        other => panic!("re-apply failed: {:?}", other),
    }
    let record = harness.chain.read_amount_output(7, 0).unwrap();
    assert_eq!(record.height, summary.height);
    assert_eq!(harness.state_image(), image_applied);
}

#[test]
fn test_undo_several_blocks_in_reverse() {
    let mut harness = TestChain::new();
    harness.mine_to_height(3);
    let image_at_3 = harness.state_image();
    let tip_at_3 = harness.chain.tip().clone();
    harness.mine_to_height(5);
    harness.chain.undo_tip_block().unwrap();
    harness.chain.undo_tip_block().unwrap();
    assert_eq!(harness.chain.tip_height(), 3);
    assert_eq!(harness.chain.tip().hash, tip_at_3.hash);
    assert_eq!(harness.state_image(), image_at_3);
    assert_dense_output_buckets(&mut harness);
}

// ============ Persistence Tests ============

#[test]
fn test_reopen_restores_tip() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = ChainConfig {
        data_dir: temp_dir.path().to_path_buf(),
        testnet: true,
        check_pow: false,
        pool_byte_cap: params::MAX_POOL_SIZE,
    };

    let tip_hash;
    let tip_height;
    {
        let mut chain = ChainState::open(config.clone()).unwrap();
        let clock = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(TEST_GENESIS_TIME));
        let handle = std::sync::Arc::clone(&clock);
        chain.set_clock(Box::new(move || {
            handle.load(std::sync::atomic::Ordering::Relaxed)
        }));
        let miner = nacre_primitives::AccountAddress {
            spend_public_key: nacre_primitives::crypto::keypair_from_seed(b"m1").public_key,
            view_public_key: nacre_primitives::crypto::keypair_from_seed(b"m2").public_key,
        };
        for _ in 0..3 {
            clock.fetch_add(120, std::sync::atomic::Ordering::Relaxed);
            let (template, _, _) = chain.create_mining_block_template(&miner, b"x").unwrap();
            let (result, _) = chain.add_mined_block(&template.to_bytes()).unwrap();
            assert!(matches!(result, BlockAddResult::Accepted(_)));
        }
        tip_hash = chain.tip().hash;
        tip_height = chain.tip_height();
        chain.db_commit().unwrap();
    }

    let reopened = ChainState::open(config).unwrap();
    assert_eq!(reopened.tip_height(), tip_height);
    assert_eq!(reopened.tip().hash, tip_hash);
}

// ============ Emission Accounting Tests ============

#[test]
fn test_emission_accumulates_per_block() {
    let mut harness = TestChain::new();
    let genesis_coins = harness.chain.tip().already_generated_coins;
    let (summary, _) = harness.mine_block();
    assert!(summary.already_generated_coins > genesis_coins);
    assert_eq!(summary.already_generated_transactions, 2);
    // Coinbase-only block: reward equals base reward, no fees.
    assert_eq!(summary.total_fee_amount, 0);
    assert_eq!(summary.reward, summary.base_reward);
    let mined = harness
        .chain
        .read_raw_block(&summary.hash)
        .and_then(|raw| nacre_primitives::Block::from_raw_block(&raw).ok())
        .unwrap();
    assert!(matches!(
        mined.header.base_transaction.prefix.inputs[0],
        TransactionInput::Coinbase(_)
    ));
}

// ============ Cumulative Difficulty Tests ============

#[test]
fn test_cumulative_difficulty_is_additive() {
    let mut harness = TestChain::new();
    let mut previous = harness.chain.tip().clone();
    for _ in 0..5 {
        let (summary, _) = harness.mine_block();
        assert_eq!(
            summary.cumulative_difficulty,
            previous.cumulative_difficulty + u128::from(summary.difficulty)
        );
        previous = summary;
    }
}
