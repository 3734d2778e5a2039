//! Deterministic wallets and transaction builders for tests.

use nacre_chain::{ChainState, UtxoRead};
use nacre_currency::{get_transaction_public_key, hashing};
use nacre_primitives::crypto;
use nacre_primitives::{
    AccountAddress, Amount, Block, Hash, KeyImage, KeyInput, KeyOutput, KeyPair, OutputTarget,
    PublicKey, SecretKey, Transaction, TransactionInput, TransactionOutput, TransactionPrefix,
    UnlockMoment,
};

/// An output the test wallet can spend.
#[derive(Clone, Debug)]
pub struct OwnedOutput {
    pub amount: Amount,
    pub global_index: u32,
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

impl OwnedOutput {
    pub fn key_image(&self) -> KeyImage {
        crypto::generate_key_image(&self.public_key, &self.secret_key)
            .expect("owned output key is valid")
    }
}

/// A scanning wallet over fixed seed keys.
pub struct TestWallet {
    pub spend: KeyPair,
    pub view: KeyPair,
    pub owned: Vec<OwnedOutput>,
}

impl TestWallet {
    pub fn from_seeds(spend_seed: &[u8], view_seed: &[u8]) -> Self {
        Self {
            spend: crypto::keypair_from_seed(spend_seed),
            view: crypto::keypair_from_seed(view_seed),
            owned: Vec::new(),
        }
    }

    /// The wallet owning the genesis coinbase.
    pub fn genesis_wallet() -> Self {
        Self::from_seeds(b"nacre genesis spend key", b"nacre genesis view key")
    }

    pub fn address(&self) -> AccountAddress {
        AccountAddress {
            spend_public_key: self.spend.public_key,
            view_public_key: self.view.public_key,
        }
    }

    /// Scan a committed block for outputs paid to this wallet.
    pub fn scan_block(&mut self, chain: &ChainState, block_hash: &Hash) {
        let raw = chain
            .read_raw_block(block_hash)
            .expect("scanned block not stored");
        let block = Block::from_raw_block(&raw).expect("stored block undecodable");
        let indices = chain
            .read_block_output_global_indices(block_hash)
            .expect("scanned block has no output indices");

        let mut transactions: Vec<&Transaction> = Vec::with_capacity(block.transactions.len() + 1);
        transactions.push(&block.header.base_transaction);
        transactions.extend(block.transactions.iter());

        for (tx, per_tx_indices) in transactions.iter().zip(indices.iter()) {
            let tx_public_key = match get_transaction_public_key(&tx.prefix.extra) {
                Some(key) => key,
                None => continue,
            };
            let derivation =
                match crypto::generate_key_derivation(&tx_public_key, &self.view.secret_key) {
                    Some(derivation) => derivation,
                    None => continue,
                };
            for (output_index, output) in tx.prefix.outputs.iter().enumerate() {
                let OutputTarget::Key(key_output) = &output.target;
                let derived = crypto::derive_public_key(
                    &derivation,
                    output_index as u64,
                    &self.spend.public_key,
                );
                if derived != Some(key_output.key) {
                    continue;
                }
                let secret_key = crypto::derive_secret_key(
                    &derivation,
                    output_index as u64,
                    &self.spend.secret_key,
                )
                .expect("wallet spend key is canonical");
                self.owned.push(OwnedOutput {
                    amount: output.amount,
                    global_index: per_tx_indices[output_index],
                    public_key: key_output.key,
                    secret_key,
                });
            }
        }
    }

    /// First owned output of exactly `amount`.
    pub fn find_output(&self, amount: Amount) -> Option<OwnedOutput> {
        self.owned.iter().find(|o| o.amount == amount).cloned()
    }
}

/// Absolute ring indices encoded as differences (first absolute, then
/// offsets), the in-transaction representation.
pub fn differential_indexes(absolute: &[u32]) -> Vec<u32> {
    let mut differential = Vec::with_capacity(absolute.len());
    let mut previous = 0u32;
    for (i, index) in absolute.iter().enumerate() {
        if i == 0 {
            differential.push(*index);
        } else {
            differential.push(index - previous);
        }
        previous = *index;
    }
    differential
}

/// Build and sign a spend of `sources` into `out_amounts`, paid back to
/// `recipient`. Every input uses a one-member ring (fully transparent).
pub fn build_spend_tx(
    sources: &[OwnedOutput],
    out_amounts: &[Amount],
    recipient: &TestWallet,
    unlock_time: UnlockMoment,
) -> (Hash, Transaction, Vec<u8>) {
    let rings: Vec<Vec<(u32, PublicKey)>> = sources
        .iter()
        .map(|source| vec![(source.global_index, source.public_key)])
        .collect();
    build_spend_tx_with_rings(sources, &rings, out_amounts, recipient, unlock_time)
}

/// Build and sign a spend where input `i` hides among `rings[i]`, a list
/// of `(global_index, public_key)` ring members containing the real one.
pub fn build_spend_tx_with_rings(
    sources: &[OwnedOutput],
    rings: &[Vec<(u32, PublicKey)>],
    out_amounts: &[Amount],
    recipient: &TestWallet,
    unlock_time: UnlockMoment,
) -> (Hash, Transaction, Vec<u8>) {
    assert_eq!(sources.len(), rings.len());
    let mut rng = rand::thread_rng();
    let tx_key = crypto::random_keypair(&mut rng);

    let mut extra = vec![nacre_currency::TX_EXTRA_TAG_PUBKEY];
    extra.extend_from_slice(&tx_key.public_key.0);

    let derivation = crypto::generate_key_derivation(
        &recipient.address().view_public_key,
        &tx_key.secret_key,
    )
    .expect("recipient view key is valid");
    let outputs: Vec<TransactionOutput> = out_amounts
        .iter()
        .enumerate()
        .map(|(index, amount)| TransactionOutput {
            amount: *amount,
            target: OutputTarget::Key(KeyOutput {
                key: crypto::derive_public_key(
                    &derivation,
                    index as u64,
                    &recipient.address().spend_public_key,
                )
                .expect("recipient spend key is valid"),
            }),
        })
        .collect();

    let inputs: Vec<TransactionInput> = sources
        .iter()
        .zip(rings.iter())
        .map(|(source, ring)| {
            let absolute: Vec<u32> = ring.iter().map(|(index, _)| *index).collect();
            TransactionInput::Key(KeyInput {
                amount: source.amount,
                output_indexes: differential_indexes(&absolute),
                key_image: source.key_image(),
            })
        })
        .collect();

    let prefix = TransactionPrefix {
        version: 1,
        unlock_time,
        inputs,
        outputs,
        extra,
    };
    let prefix_hash = hashing::get_transaction_prefix_hash(&prefix);

    let signatures = sources
        .iter()
        .zip(rings.iter())
        .map(|(source, ring)| {
            let ring_keys: Vec<PublicKey> = ring.iter().map(|(_, key)| *key).collect();
            let secret_index = ring
                .iter()
                .position(|(index, _)| *index == source.global_index)
                .expect("ring must contain the real output");
            crypto::generate_ring_signature(
                &prefix_hash,
                &source.key_image(),
                &ring_keys,
                &source.secret_key,
                secret_index,
                &mut rng,
            )
            .expect("ring signing cannot fail on valid keys")
        })
        .collect();

    let tx = Transaction { prefix, signatures };
    let binary = tx.to_bytes();
    let tid = hashing::get_transaction_hash(&tx);
    (tid, tx, binary)
}

/// Look up ring member keys on the chain for the given absolute indices.
pub fn ring_members(
    chain: &ChainState,
    amount: Amount,
    absolute_indexes: &[u32],
) -> Vec<(u32, PublicKey)> {
    absolute_indexes
        .iter()
        .map(|index| {
            let record = chain
                .read_amount_output(amount, *index)
                .expect("ring member missing on chain");
            (*index, record.public_key)
        })
        .collect()
}
