//! Block-level ledger validation: coinbase maturity, double spends and
//! ring-signature enforcement.

use crate::generators::{build_spend_tx, build_spend_tx_with_rings, ring_members, TestWallet};
use crate::harness::TestChain;
use nacre_chain::{AddTransactionResult, BlockAddResult, UtxoRead};
use nacre_consensus::ConsensusError;
use nacre_currency::params;
use nacre_primitives::{RawBlock, Transaction};

/// Craft a block over the current tip containing `txs`, reusing the
/// template machinery for a correct coinbase (fees must be zero so the
/// template's reward stays right).
fn craft_block_with_txs(
    harness: &mut TestChain,
    txs: &[(nacre_primitives::Hash, Transaction, Vec<u8>)],
) -> RawBlock {
    harness.advance_clock(params::DIFFICULTY_TARGET);
    let miner = harness.miner_address();
    let (mut template, _, _) = harness
        .chain
        .create_mining_block_template(&miner, b"test")
        .expect("template build failed");
    let mut bodies = Vec::with_capacity(txs.len());
    for (tid, _, binary) in txs {
        template.transaction_hashes.push(*tid);
        bodies.push(binary.clone());
    }
    RawBlock {
        block: template.to_bytes(),
        transactions: bodies,
    }
}

fn genesis_wallet_on(harness: &TestChain) -> TestWallet {
    let mut wallet = TestWallet::genesis_wallet();
    wallet.scan_block(&harness.chain, &harness.chain.currency().genesis_block_hash);
    wallet
}

// ============ Coinbase Maturity Tests ============

#[test]
fn test_immature_coinbase_spend_rejected_then_accepted() {
    let mut harness = TestChain::new();
    let window = params::MINED_MONEY_UNLOCK_WINDOW;
    // Genesis coinbase unlocks at height `window`; with one block of
    // slack it becomes spendable in the block at height `window - 1`.
    harness.mine_to_height(window - 3);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();

    // Zero-fee spend keeps the template's coinbase reward valid.
    let spend = build_spend_tx(&[source], &[6_000_000], &wallet, 0);

    // Block at height window - 2: still locked.
    let locked_block = craft_block_with_txs(&mut harness, &[spend.clone()]);
    match harness.chain.add_block(locked_block).unwrap() {
        BlockAddResult::Rejected(ConsensusError::InputSpendLockedOut) => {}
        other => panic!("expected INPUT_SPEND_LOCKED_OUT, got {:?}", other),
    }

    // One block later the same transaction is fine.
    harness.mine_to_height(window - 2);
    let mature_block = craft_block_with_txs(&mut harness, &[spend]);
    match harness.chain.add_block(mature_block).unwrap() {
        BlockAddResult::Accepted(info) => assert_eq!(info.height, window - 1),
        other => panic!("expected acceptance, got {:?}", other),
    }
}

#[test]
fn test_immature_coinbase_spend_fails_pool_admission() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW - 3);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(70_000_000).unwrap();
    let (tid, tx, binary) = build_spend_tx(&[source], &[69_000_000], &wallet, 0);
    match harness.chain.add_transaction(tid, tx, binary, 0) {
        AddTransactionResult::FailedToRedo {
            reason: ConsensusError::InputSpendLockedOut,
            ..
        } => {}
        other => panic!("expected soft lock-out failure, got {:?}", other),
    }
}

// ============ Double Spend Tests ============

#[test]
fn test_double_spend_across_blocks_rejected() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();

    let first = build_spend_tx(&[source.clone()], &[6_000_000], &wallet, 0);
    let first_block = craft_block_with_txs(&mut harness, &[first]);
    let spend_height = match harness.chain.add_block(first_block).unwrap() {
        BlockAddResult::Accepted(info) => info.height,
        other => panic!("first spend should apply: {:?}", other),
    };
    assert_eq!(
        harness.chain.read_keyimage(&source.key_image()),
        Some(spend_height)
    );

    // A different transaction consuming the same key image.
    let second = build_spend_tx(&[source], &[5_000_000, 1_000_000], &wallet, 0);
    let second_block = craft_block_with_txs(&mut harness, &[second]);
    match harness.chain.add_block(second_block).unwrap() {
        BlockAddResult::Rejected(ConsensusError::InputKeyimageAlreadySpent) => {}
        other => panic!("expected INPUT_KEYIMAGE_ALREADY_SPENT, got {:?}", other),
    }
}

#[test]
fn test_double_spend_within_one_block_rejected() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();

    let spend_a = build_spend_tx(&[source.clone()], &[6_000_000], &wallet, 0);
    let spend_b = build_spend_tx(&[source], &[5_500_000, 500_000], &wallet, 0);
    let block = craft_block_with_txs(&mut harness, &[spend_a, spend_b]);
    match harness.chain.add_block(block).unwrap() {
        BlockAddResult::Rejected(ConsensusError::InputKeyimageAlreadySpent) => {}
        other => panic!("expected INPUT_KEYIMAGE_ALREADY_SPENT, got {:?}", other),
    }
}

// ============ Ring Signature Tests ============

#[test]
fn test_corrupted_signature_rejected() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();

    let (_, mut tx, _) = build_spend_tx(&[source], &[6_000_000], &wallet, 0);
    // Flip a byte in the response scalar.
    tx.signatures[0][0].0[40] ^= 0x01;
    let binary = tx.to_bytes();
    let tid = nacre_currency::hashing::get_transaction_hash(&tx);

    // The deferred parallel check during block apply must catch it.
    let block = craft_block_with_txs(&mut harness, &[(tid, tx.clone(), binary.clone())]);
    match harness.chain.add_block(block).unwrap() {
        BlockAddResult::Rejected(ConsensusError::InputInvalidSignatures) => {}
        other => panic!("expected INPUT_INVALID_SIGNATURES, got {:?}", other),
    }

    // The inline check at pool admission as well.
    match harness.chain.add_transaction(tid, tx, binary, 0) {
        AddTransactionResult::FailedToRedo {
            reason: ConsensusError::InputInvalidSignatures,
            ..
        } => {}
        other => panic!("expected signature failure, got {:?}", other),
    }
}

#[test]
fn test_ring_position_of_real_output_is_free() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW);
    let mut wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();

    // Create a bucket of six equal outputs to draw ring members from.
    let (tid, tx, binary) = build_spend_tx(
        &[source],
        &[1_000_000, 1_000_000, 1_000_000, 1_000_000, 1_000_000, 1_000_000],
        &wallet,
        0,
    );
    let now = harness.clock.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(
        harness.chain.add_transaction(tid, tx, binary, now),
        AddTransactionResult::BroadcastAll
    );
    let (summary, _) = harness.mine_block();
    wallet.scan_block(&harness.chain, &summary.hash);

    // Spend the output at global index 2, hidden mid-ring among 0 and 4.
    let real = wallet
        .owned
        .iter()
        .find(|o| o.amount == 1_000_000 && o.global_index == 2)
        .cloned()
        .unwrap();
    let ring = ring_members(&harness.chain, 1_000_000, &[0, 2, 4]);
    let spend = build_spend_tx_with_rings(&[real], &[ring], &[1_000_000], &wallet, 0);
    let block = craft_block_with_txs(&mut harness, &[spend]);
    match harness.chain.add_block(block).unwrap() {
        BlockAddResult::Accepted(_) => {}
        other => panic!("mid-ring spend should verify: {:?}", other),
    }
}

// ============ Transparent Spend Hint Tests ============

#[test]
fn test_single_member_ring_marks_spent_hint() {
    let mut harness = TestChain::new();
    harness.mine_to_height(params::MINED_MONEY_UNLOCK_WINDOW);
    let wallet = genesis_wallet_on(&harness);
    let source = wallet.find_output(6_000_000).unwrap();
    let source_index = source.global_index;

    let spend = build_spend_tx(&[source], &[6_000_000], &wallet, 0);
    let block = craft_block_with_txs(&mut harness, &[spend]);
    assert!(matches!(
        harness.chain.add_block(block).unwrap(),
        BlockAddResult::Accepted(_)
    ));
    let record = harness
        .chain
        .read_amount_output(6_000_000, source_index)
        .unwrap();
    assert!(record.spent, "transparent spend must set the hint");

    // Undo flips it back.
    harness.chain.undo_tip_block().unwrap();
    let record = harness
        .chain
        .read_amount_output(6_000_000, source_index)
        .unwrap();
    assert!(!record.spent);
}
