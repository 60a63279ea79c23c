//! End-to-end chain flows: the faucet/transfer/replay scenarios driven
//! through the block builder and ledger exactly as a leader would drive
//! them, plus cold-sync reconstruction and the equivocation slash flow.

use std::collections::BTreeMap;

use anvil::builder::{build_block, filter_transactions};
use anvil::consensus::EquivocationLedger;
use anvil::crypto::keys::SigningKeypair;
use anvil::ledger::Ledger;
use anvil::merkle::merkle_verify;
use anvil::receipt::{Challenge, Receipt};
use anvil::transaction::Transaction;

/// Commit one block carrying `txs` on top of `ledger`, as the epoch leader
/// would.
fn commit(ledger: &mut Ledger, leader: &SigningKeypair, txs: Vec<Transaction>) {
    let epoch = ledger.head().0 + 1;
    let block = build_block(ledger, leader, epoch, 1_000 + epoch, &[], &txs, BTreeMap::new(), 0);
    ledger.append(block).unwrap();
}

#[test]
fn faucet_then_two_transfers() {
    // Scenario: fresh network; N1 faucets 1000, then sends 100 and 200 to N2.
    let leader = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let n2 = SigningKeypair::generate().address();
    let mut ledger = Ledger::in_memory();

    let faucet_ts = 1_234_567;
    commit(&mut ledger, &leader, vec![Transaction::coinbase(n1.address(), 1000, faucet_ts)]);
    assert_eq!(ledger.account(&n1.address()).balance, 1000);
    // The coinbase nonce is its timestamp and never touches the recipient's
    // account nonce.
    assert_eq!(ledger.account(&n1.address()).nonce, 0);
    assert_eq!(ledger.block_at(1).unwrap().transactions[0].nonce, faucet_ts);

    commit(&mut ledger, &leader, vec![Transaction::transfer(&n1, n2, 100, 1, 2_000)]);
    assert_eq!(ledger.account(&n1.address()).balance, 900);
    assert_eq!(ledger.account(&n2).balance, 100);
    assert_eq!(ledger.account(&n1.address()).nonce, 1);

    commit(&mut ledger, &leader, vec![Transaction::transfer(&n1, n2, 200, 2, 3_000)]);
    assert_eq!(ledger.account(&n1.address()).balance, 700);
    assert_eq!(ledger.account(&n2).balance, 300);
    assert_eq!(ledger.account(&n1.address()).nonce, 2);

    // Conservation after every commit
    assert_eq!(ledger.balance_sum(), ledger.total_minted());
}

#[test]
fn committed_transaction_cannot_replay() {
    // Scenario: resubmitting the exact signed transaction after commit.
    let leader = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let n2 = SigningKeypair::generate().address();
    let mut ledger = Ledger::in_memory();

    commit(&mut ledger, &leader, vec![Transaction::coinbase(n1.address(), 1000, 1)]);
    let spend = Transaction::transfer(&n1, n2, 100, 1, 2);
    commit(&mut ledger, &leader, vec![spend.clone()]);

    // The nonce rule alone keeps the replay out of any later block.
    assert!(filter_transactions(&ledger, std::slice::from_ref(&spend)).is_empty());
}

#[test]
fn double_spend_resolves_to_first_accepted() {
    // Scenario: two spends of 600 from a 1000 balance, both nonce 1.
    let leader = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let alice = SigningKeypair::generate().address();
    let bob = SigningKeypair::generate().address();
    let mut ledger = Ledger::in_memory();

    commit(&mut ledger, &leader, vec![Transaction::coinbase(n1.address(), 1000, 1)]);
    let to_alice = Transaction::transfer(&n1, alice, 600, 1, 2);
    let to_bob = Transaction::transfer(&n1, bob, 600, 1, 3);
    commit(&mut ledger, &leader, vec![to_alice, to_bob]);

    let block = ledger.block_at(2).unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].to, alice);
    assert_eq!(ledger.account(&alice).balance, 600);
    assert_eq!(ledger.account(&bob).balance, 0);
    assert_eq!(ledger.account(&n1.address()).balance, 400);
}

#[test]
fn out_of_order_nonce_waits_for_its_turn() {
    // Scenario: nonce 3 submitted while the account sits at nonce 1.
    let leader = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let n2 = SigningKeypair::generate().address();
    let mut ledger = Ledger::in_memory();

    commit(&mut ledger, &leader, vec![Transaction::coinbase(n1.address(), 1000, 1)]);
    commit(&mut ledger, &leader, vec![Transaction::transfer(&n1, n2, 10, 1, 2)]);

    let early = Transaction::transfer(&n1, n2, 10, 3, 3);
    assert!(filter_transactions(&ledger, std::slice::from_ref(&early)).is_empty());

    // After nonce 2 commits, the same transaction becomes valid.
    commit(&mut ledger, &leader, vec![Transaction::transfer(&n1, n2, 10, 2, 4)]);
    let accepted = filter_transactions(&ledger, std::slice::from_ref(&early));
    assert_eq!(accepted.len(), 1);
    commit(&mut ledger, &leader, accepted);
    assert_eq!(ledger.account(&n1.address()).nonce, 3);
}

#[test]
fn cold_sync_reaches_identical_state() {
    // Scenario: a fresh node adopts the chain and replays to the same
    // balances and nonces.
    let leader = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let n2 = SigningKeypair::generate().address();
    let mut source = Ledger::in_memory();

    commit(&mut source, &leader, vec![Transaction::coinbase(n1.address(), 1000, 1)]);
    commit(&mut source, &leader, vec![Transaction::transfer(&n1, n2, 250, 1, 2)]);
    commit(&mut source, &leader, vec![Transaction::transfer(&n1, n2, 50, 2, 3)]);

    let mut fresh = Ledger::in_memory();
    fresh.replace_chain(source.chain().to_vec()).unwrap();

    assert_eq!(fresh.head(), source.head());
    for address in [n1.address(), n2] {
        assert_eq!(fresh.account(&address), source.account(&address));
    }
    assert_eq!(fresh.total_minted(), source.total_minted());
}

#[test]
fn receipts_commit_with_proofs_and_rewards() {
    // A block carrying receipts and effectiveness-driven rewards, with a
    // verifiable SPV proof for a committed transaction.
    let leader = SigningKeypair::generate();
    let responder = SigningKeypair::generate();
    let n1 = SigningKeypair::generate();
    let mut ledger = Ledger::in_memory();

    commit(&mut ledger, &leader, vec![Transaction::coinbase(n1.address(), 400, 1)]);

    let challenge = Challenge::new(leader.address(), responder.address(), 2);
    let receipt = Receipt::respond(&challenge, &responder, 5_000);
    let spend = Transaction::transfer(&n1, responder.address(), 40, 1, 5_001);
    let mut updates = BTreeMap::new();
    updates.insert(responder.address(), 0.25);

    let block = build_block(
        &ledger,
        &leader,
        2,
        5_002,
        std::slice::from_ref(&receipt),
        std::slice::from_ref(&spend),
        updates,
        100,
    );
    assert_eq!(block.rewards[&responder.address()], 100);
    ledger.append(block).unwrap();

    // Reward plus transfer landed
    assert_eq!(ledger.account(&responder.address()).balance, 140);
    // Minted = faucet + reward pool share
    assert_eq!(ledger.total_minted(), 500);

    // SPV proof for the committed spend verifies against the txRoot
    let proof = ledger.proof_for(&spend.digest()).unwrap();
    assert_eq!(proof.block_epoch, 2);
    assert!(merkle_verify(&spend.digest(), &proof.proof, &proof.tx_root));
}

#[test]
fn equivocating_leader_is_slashed_at_every_observer() {
    // Scenario: N1 signs two distinct blocks for one epoch; N2 and N3 each
    // see both and independently debit min(balance, 500).
    let honest_leader = SigningKeypair::generate();
    let byzantine = SigningKeypair::generate();

    // Both observers hold the same chain where the byzantine node owns 800.
    let mut observer_two = Ledger::in_memory();
    commit(&mut observer_two, &honest_leader, vec![Transaction::coinbase(byzantine.address(), 800, 1)]);
    let mut observer_three = Ledger::in_memory();
    observer_three.replace_chain(observer_two.chain().to_vec()).unwrap();

    // The byzantine leader crafts two valid blocks for epoch 2.
    let block_a = build_block(&observer_two, &byzantine, 2, 7, &[], &[], BTreeMap::new(), 0);
    let fork_tx = Transaction::coinbase(byzantine.address(), 9, 8);
    let block_b = build_block(&observer_two, &byzantine, 2, 7, &[], &[fork_tx], BTreeMap::new(), 0);

    for (observer, first, second) in [
        (&mut observer_two, &block_a, &block_b),
        (&mut observer_three, &block_b, &block_a), // opposite arrival order
    ] {
        let mut window = EquivocationLedger::default();
        assert!(window.observe(first).is_none());
        let evidence = window.observe(second).unwrap();
        assert!(evidence.verify());
        assert_eq!(evidence.offender(), byzantine.address());

        let debited = observer.slash(evidence.offender(), 500);
        assert_eq!(debited, Some(500));
        assert_eq!(observer.account(&byzantine.address()).balance, 300);
        // Slashed-once: further evidence does not debit again
        assert_eq!(observer.slash(evidence.offender(), 500), None);
    }
}

#[test]
fn slash_debit_survives_replay() {
    let leader = SigningKeypair::generate();
    let byzantine = SigningKeypair::generate();
    let mut ledger = Ledger::in_memory();
    commit(&mut ledger, &leader, vec![Transaction::coinbase(byzantine.address(), 600, 1)]);

    ledger.slash(byzantine.address(), 500);
    assert_eq!(ledger.account(&byzantine.address()).balance, 100);

    ledger.replay();
    assert_eq!(ledger.account(&byzantine.address()).balance, 100);
    assert_eq!(
        ledger.balance_sum(),
        ledger.total_minted() - ledger.total_slashed()
    );
}
