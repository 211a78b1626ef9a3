use plexlog::{
    CommandFrame, EntryMetadata, Runtime, RuntimeError, StateMachine, StreamId, Timestamp,
    TxCommand, TxContext, TxError, TxMode, TxRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Default, PartialEq, Eq)]
struct Account {
    balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum AccountCmd {
    Deposit(i64),
    Withdraw(i64),
}

impl StateMachine for Account {
    type Command = AccountCmd;

    fn apply(&mut self, command: &AccountCmd) {
        match command {
            AccountCmd::Deposit(n) => self.balance += n,
            AccountCmd::Withdraw(n) => self.balance -= n,
        }
    }
}

/// Moves funds between two accounts, failing when the source is short.
#[derive(Debug, Serialize, Deserialize)]
struct Transfer {
    from: StreamId,
    to: StreamId,
    amount: i64,
}

impl TxCommand for Transfer {
    fn execute(&self, ctx: &mut TxContext<'_>) -> Result<Value, TxError> {
        let available = ctx.read::<Account, _>(self.from, |account| account.balance)?;
        if available < self.amount {
            return Err(TxError::Aborted { at: 0 });
        }
        ctx.update::<Account, _>(self.from, |account| account.balance -= self.amount)?;
        ctx.update::<Account, _>(self.to, |account| account.balance += self.amount)?;
        Ok(json!(available - self.amount))
    }
}

fn runtime() -> Runtime {
    let (runtime, _) = Runtime::in_memory(vec![
        vec!["memory:l0-0".into(), "memory:l0-1".into()],
        vec!["memory:l1-0".into(), "memory:l1-1".into()],
    ])
    .unwrap();
    runtime.commands().register_typed::<Transfer>("transfer");
    runtime
}

#[test]
fn simple_transaction_commits_across_both_streams() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    let target = runtime.open_object::<Account>(to).unwrap();
    source.propose(&AccountCmd::Deposit(100)).unwrap();

    let value = runtime
        .run_simple(
            &[from, to],
            "transfer",
            json!({ "from": from, "to": to, "amount": 30 }),
        )
        .unwrap();
    assert_eq!(value, Some(json!(70)));
    assert_eq!(source.query(|account| account.balance).unwrap(), 70);
    assert_eq!(target.query(|account| account.balance).unwrap(), 30);
}

#[test]
fn failing_command_reports_abort_and_leaves_state_untouched() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    let target = runtime.open_object::<Account>(to).unwrap();
    source.propose(&AccountCmd::Deposit(10)).unwrap();

    let result = runtime.run_simple(
        &[from, to],
        "transfer",
        json!({ "from": from, "to": to, "amount": 500 }),
    );
    assert!(matches!(
        result,
        Err(RuntimeError::Tx(TxError::Aborted { .. }))
    ));
    assert_eq!(source.query(|account| account.balance).unwrap(), 10);
    assert_eq!(target.query(|account| account.balance).unwrap(), 0);
}

#[test]
fn stale_precondition_aborts_on_replay() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    let target = runtime.open_object::<Account>(to).unwrap();
    let funded = source.propose(&AccountCmd::Deposit(100)).unwrap();
    source.sync(Timestamp::Latest).unwrap();

    // A competing writer lands on the source stream after the precondition
    // was captured but before the transaction record.
    source.propose(&AccountCmd::Withdraw(95)).unwrap();

    let record = TxRecord {
        command: "transfer".to_string(),
        args: json!({ "from": from, "to": to, "amount": 30 }),
        precondition: funded,
        mode: TxMode::Simple,
    };
    let at = runtime.sequencer().reserve(1).unwrap();
    let frame = CommandFrame::transaction(serde_json::to_vec(&record).unwrap());
    runtime
        .chain()
        .write(at, EntryMetadata::for_streams([from, to]), frame.encode())
        .unwrap();

    source.sync(Timestamp::Position(at)).unwrap();
    target.sync(Timestamp::Position(at)).unwrap();
    let outcome = runtime.outcomes().get(at).unwrap();
    assert!(outcome.is_aborted());
    // The interloping withdrawal applied; the transaction did not.
    assert_eq!(source.with(|account| account.balance).unwrap(), 5);
    assert_eq!(target.with(|account| account.balance).unwrap(), 0);
}

#[test]
fn deferred_transaction_discovers_participants_at_replay() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    let target = runtime.open_object::<Account>(to).unwrap();
    source.propose(&AccountCmd::Deposit(50)).unwrap();

    let value = runtime
        .run_deferred(
            "transfer",
            json!({ "from": from, "to": to, "amount": 20 }),
        )
        .unwrap();
    assert_eq!(value, Some(json!(30)));
    assert_eq!(source.query(|account| account.balance).unwrap(), 30);
    assert_eq!(target.query(|account| account.balance).unwrap(), 20);
}

#[test]
fn deferred_entries_are_broadcast_to_late_openers() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    source.propose(&AccountCmd::Deposit(50)).unwrap();
    runtime
        .run_deferred(
            "transfer",
            json!({ "from": from, "to": to, "amount": 20 }),
        )
        .unwrap();

    // An object opened after the fact still replays the broadcast record.
    let late = runtime.open_object::<Account>(to).unwrap();
    assert_eq!(late.query(|account| account.balance).unwrap(), 20);
}

#[test]
fn deferred_transactions_skip_raw_stream_payloads() {
    let runtime = runtime();
    let (from, to) = (StreamId::new(), StreamId::new());
    let source = runtime.open_object::<Account>(from).unwrap();
    source.propose(&AccountCmd::Deposit(50)).unwrap();
    // Raw appends share the physical log with framed commands; the
    // deferred walk has to step over them.
    runtime
        .open_stream(StreamId::new())
        .append(b"not-a-frame".to_vec())
        .unwrap();

    let value = runtime
        .run_deferred(
            "transfer",
            json!({ "from": from, "to": to, "amount": 20 }),
        )
        .unwrap();
    assert_eq!(value, Some(json!(30)));
    let target = runtime.open_object::<Account>(to).unwrap();
    assert_eq!(target.query(|account| account.balance).unwrap(), 20);
}

#[test]
fn unknown_commands_abort_at_replay() {
    let runtime = runtime();
    let stream = StreamId::new();
    runtime.open_object::<Account>(stream).unwrap();
    let result = runtime.run_simple(&[stream], "mint", json!({}));
    assert!(matches!(
        result,
        Err(RuntimeError::Tx(TxError::Aborted { .. }))
    ));
}

#[test]
fn reattaching_a_stream_with_a_different_type_fails() {
    let runtime = runtime();
    let stream = StreamId::new();
    runtime.open_object::<Account>(stream).unwrap();

    #[derive(Default)]
    struct Register {
        value: u64,
    }
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Set(u64);
    impl StateMachine for Register {
        type Command = Set;
        fn apply(&mut self, command: &Set) {
            self.value = command.0;
        }
    }

    assert!(runtime.open_object::<Register>(stream).is_err());
}
