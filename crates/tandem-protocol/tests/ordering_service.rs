//! Ordering service contract tests
//!
//! Drives the in-memory service through the handshake, sequencing, watermark
//! and compaction rules every implementation must honor.

use serde_json::{json, Value};
use tandem_core::{ClientId, DocumentId, TandemConfig, TandemError, TenantId};
use tandem_protocol::{
    split_contents, ClientDescriptor, Connection, DocumentMessage, InboundMessage,
    LocalOrderingService, Operation, OrderingService,
};

const TOKEN: &str = "secret";

fn ids() -> (TenantId, DocumentId) {
    (TenantId::new("acme"), DocumentId::new("board"))
}

async fn service_with(config: &TandemConfig) -> LocalOrderingService {
    let service = LocalOrderingService::new(config);
    service.add_tenant("acme", TOKEN);
    let (tenant, document) = ids();
    service
        .create_document(&tenant, &document, TOKEN)
        .await
        .unwrap();
    service
}

async fn service() -> LocalOrderingService {
    service_with(&TandemConfig::default()).await
}

async fn connect(service: &LocalOrderingService, user: &str) -> Connection {
    let (tenant, document) = ids();
    service
        .connect(&tenant, &document, TOKEN, ClientDescriptor::writer(user))
        .await
        .unwrap()
}

fn message(csn: u64, reference: u64, contents: Value) -> DocumentMessage {
    DocumentMessage {
        client_sequence_number: csn,
        reference_sequence_number: reference,
        contents,
        detached_contents: false,
    }
}

fn drain_operations(connection: &mut Connection) -> Vec<Operation> {
    let mut ops = Vec::new();
    while let Ok(message) = connection.inbound.try_recv() {
        if let InboundMessage::Operation(op) = message {
            ops.push(op);
        }
    }
    ops
}

#[tokio::test]
async fn connect_rejects_bad_token_and_unknown_targets() {
    let service = service().await;
    let (tenant, document) = ids();

    let err = service
        .connect(&tenant, &document, "wrong", ClientDescriptor::writer("eve"))
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::Auth { .. }));
    assert!(err.is_retryable());

    let err = service
        .connect(
            &TenantId::new("nobody"),
            &document,
            TOKEN,
            ClientDescriptor::writer("eve"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::NotFound { .. }));

    let err = service
        .connect(
            &tenant,
            &DocumentId::new("missing"),
            TOKEN,
            ClientDescriptor::writer("eve"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::NotFound { .. }));
}

#[tokio::test]
async fn fresh_document_session_is_not_existing() {
    let service = service().await;
    let connection = connect(&service, "alice").await;
    assert!(!connection.session.existing);
    assert!(connection.session.backlog_operations.is_empty());
    assert_eq!(connection.session.max_message_size, 16 * 1024);

    // Opened once, the document exists even before anything is sequenced
    let second = connect(&service, "bob").await;
    assert!(second.session.existing);
}

#[tokio::test]
async fn operations_broadcast_to_everyone_in_order() {
    let service = service().await;
    let mut alice = connect(&service, "alice").await;
    let mut bob = connect(&service, "bob").await;
    let alice_id = alice.session.client_id.clone();

    service
        .submit(
            &alice_id,
            vec![message(1, 0, json!("a1")), message(2, 0, json!("a2"))],
        )
        .await
        .unwrap();
    let ack = service
        .submit(&bob.session.client_id, vec![message(1, 2, json!("b1"))])
        .await
        .unwrap();
    assert_eq!(ack.sequence_number, 3);

    let seen_by_alice = drain_operations(&mut alice);
    let seen_by_bob = drain_operations(&mut bob);
    assert_eq!(seen_by_alice, seen_by_bob);

    let seqs: Vec<_> = seen_by_alice.iter().map(|op| op.sequence_number).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(seen_by_alice[0].client_id, alice_id);
    assert_eq!(seen_by_alice[1].contents, json!("a2"));
}

#[tokio::test]
async fn client_sequence_numbers_must_be_contiguous() {
    let service = service().await;
    let alice = connect(&service, "alice").await;
    let err = service
        .submit(&alice.session.client_id, vec![message(2, 0, json!(null))])
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::ProtocolOrder { .. }));
}

#[tokio::test]
async fn reader_cannot_submit() {
    let service = service().await;
    let (tenant, document) = ids();
    let reader = service
        .connect(&tenant, &document, TOKEN, ClientDescriptor::reader("viewer"))
        .await
        .unwrap();
    let err = service
        .submit(&reader.session.client_id, vec![message(1, 0, json!(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::InvalidState { .. }));
}

#[tokio::test]
async fn watermark_waits_for_every_connected_client() {
    let service = service().await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    let bob = connect(&service, "bob").await;
    let alice_id = alice.session.client_id.clone();
    let bob_id = bob.session.client_id.clone();

    let batch: Vec<_> = (1..=5).map(|i| message(i, 0, json!(i))).collect();
    service.submit(&alice_id, batch).await.unwrap();

    service.update_reference(&alice_id, 5).await.unwrap();
    assert_eq!(service.minimum_sequence_number(&tenant, &document).unwrap(), 0);

    service.update_reference(&bob_id, 3).await.unwrap();
    assert_eq!(service.minimum_sequence_number(&tenant, &document).unwrap(), 3);

    service.disconnect(&bob_id).await.unwrap();
    assert_eq!(service.minimum_sequence_number(&tenant, &document).unwrap(), 5);
}

#[tokio::test]
async fn snapshot_and_watermark_bound_the_backlog() {
    let service = service().await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    let alice_id = alice.session.client_id.clone();

    let batch: Vec<_> = (1..=10).map(|i| message(i, i - 1, json!(i))).collect();
    service.submit(&alice_id, batch).await.unwrap();
    assert_eq!(service.retained_operations(&tenant, &document).unwrap(), 10);

    // Watermark alone does not compact: no snapshot covers the history yet
    service.update_reference(&alice_id, 10).await.unwrap();
    assert_eq!(service.retained_operations(&tenant, &document).unwrap(), 10);

    service
        .acknowledge_snapshot(&tenant, &document, 7)
        .await
        .unwrap();
    assert_eq!(service.retained_operations(&tenant, &document).unwrap(), 3);

    let late = connect(&service, "carol").await;
    assert!(late.session.existing);
    let backlog: Vec<_> = late
        .session
        .backlog_operations
        .iter()
        .map(|op| op.sequence_number)
        .collect();
    assert_eq!(backlog, vec![8, 9, 10]);
}

#[tokio::test]
async fn retained_history_survives_snapshots_when_configured() {
    let mut config = TandemConfig::default();
    config.compaction.retain_below_watermark = true;
    let service = service_with(&config).await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    let alice_id = alice.session.client_id.clone();

    let batch: Vec<_> = (1..=4).map(|i| message(i, i - 1, json!(i))).collect();
    service.submit(&alice_id, batch).await.unwrap();
    service.update_reference(&alice_id, 4).await.unwrap();
    service
        .acknowledge_snapshot(&tenant, &document, 4)
        .await
        .unwrap();
    assert_eq!(service.retained_operations(&tenant, &document).unwrap(), 4);
}

#[tokio::test]
async fn snapshot_ahead_of_head_is_refused() {
    let service = service().await;
    let (tenant, document) = ids();
    let err = service
        .acknowledge_snapshot(&tenant, &document, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::InvalidState { .. }));
}

#[tokio::test]
async fn signals_are_broadcast_and_buffered() {
    let mut config = TandemConfig::default();
    config.protocol.signal_buffer = 2;
    let service = service_with(&config).await;
    let mut alice = connect(&service, "alice").await;
    let alice_id = alice.session.client_id.clone();

    for n in 0..3 {
        service
            .submit_signal(&alice_id, json!({ "cursor": n }))
            .await
            .unwrap();
    }
    let mut signals = 0;
    while let Ok(message) = alice.inbound.try_recv() {
        assert!(matches!(message, InboundMessage::Signal(_)));
        signals += 1;
    }
    assert_eq!(signals, 3);

    let late = connect(&service, "bob").await;
    let buffered: Vec<_> = late
        .session
        .backlog_signals
        .iter()
        .map(|s| s.contents["cursor"].clone())
        .collect();
    assert_eq!(buffered, vec![json!(1), json!(2)]);
    // Signals are never sequenced
    assert!(late.session.backlog_operations.is_empty());
}

#[tokio::test]
async fn detached_contents_travel_as_fragments() {
    let service = service().await;
    let alice = connect(&service, "alice").await;
    let alice_id = alice.session.client_id.clone();

    let contents = json!({ "stroke": vec![7; 64] });
    let fragments = split_contents(&alice_id, 1, &contents, 16).unwrap();
    let fragment_count = fragments.len();
    service.submit_content(&alice_id, fragments).await.unwrap();
    service
        .submit(
            &alice_id,
            vec![DocumentMessage {
                client_sequence_number: 1,
                reference_sequence_number: 0,
                contents: Value::Null,
                detached_contents: true,
            }],
        )
        .await
        .unwrap();

    let late = connect(&service, "bob").await;
    assert_eq!(late.session.backlog_operations.len(), 1);
    assert!(late.session.backlog_operations[0].detached_contents);
    assert_eq!(late.session.backlog_content.len(), fragment_count);
}

#[tokio::test]
async fn detached_operation_without_upload_is_refused() {
    let service = service().await;
    let alice = connect(&service, "alice").await;
    let err = service
        .submit(
            &alice.session.client_id,
            vec![DocumentMessage {
                client_sequence_number: 1,
                reference_sequence_number: 0,
                contents: Value::Null,
                detached_contents: true,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::ProtocolOrder { .. }));
}

#[tokio::test]
async fn disconnected_client_cannot_submit() {
    let service = service().await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    let alice_id = alice.session.client_id.clone();

    service.disconnect(&alice_id).await.unwrap();
    // Idempotent
    service.disconnect(&alice_id).await.unwrap();
    assert_eq!(service.connected_clients(&tenant, &document).unwrap(), 0);

    let err = service
        .submit(&alice_id, vec![message(1, 0, json!(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::Disconnected { .. }));

    let err = service
        .submit_signal(&ClientId::new("ghost"), json!(null))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn dropped_stream_removes_client_from_watermark() {
    let service = service().await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    let bob = connect(&service, "bob").await;
    let alice_id = alice.session.client_id.clone();
    drop(bob);

    service
        .submit(&alice_id, vec![message(1, 0, json!(1))])
        .await
        .unwrap();
    assert_eq!(service.connected_clients(&tenant, &document).unwrap(), 1);
    service.update_reference(&alice_id, 1).await.unwrap();
    assert_eq!(service.minimum_sequence_number(&tenant, &document).unwrap(), 1);
}

#[tokio::test]
async fn branch_inherits_history() {
    let service = service().await;
    let (tenant, document) = ids();
    let alice = connect(&service, "alice").await;
    service
        .submit(
            &alice.session.client_id,
            vec![message(1, 0, json!("x")), message(2, 0, json!("y"))],
        )
        .await
        .unwrap();

    let branch = DocumentId::new("board-draft");
    service
        .create_branch(&tenant, &document, &branch, TOKEN)
        .unwrap();
    let forked = service
        .connect(&tenant, &branch, TOKEN, ClientDescriptor::writer("bob"))
        .await
        .unwrap();
    assert_eq!(forked.session.parent_branch.as_deref(), Some("board"));
    assert!(forked.session.existing);
    assert_eq!(forked.session.backlog_operations.len(), 2);
}
