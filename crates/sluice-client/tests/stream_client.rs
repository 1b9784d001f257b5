//! Client senders and receivers against an in-process broker

mod common;

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use common::*;
use sluice_client::{
    ClientConnection, ClientError, OutputStreamOptions, StreamReceiverOptions,
    StreamSenderOptions,
};
use sluice_codec::{decode_sections, DeliveryState, ErrorCondition, Header, Section};
use sluice_engine::EngineError;

fn data_of(sections: Vec<Section>) -> Vec<u8> {
    let mut body = Vec::new();
    for section in sections {
        if let Section::Data(data) = section {
            body.extend_from_slice(&data);
        }
    }
    body
}

async fn wait_for_failure(connection: &ClientConnection) -> ClientError {
    loop {
        if let Some(failure) = connection.failure().await {
            return failure;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_send_is_accepted_and_settled() {
    let (_connection, session, mut broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .unwrap();

    let tracker = sender.send(&b"hello"[..]).await.unwrap();
    assert_eq!(
        tracker.settlement().await.unwrap(),
        Some(DeliveryState::Accepted)
    );

    let message = broker.received.recv().await.unwrap();
    let sections = decode_sections(&message).unwrap();
    assert_eq!(sections, vec![Section::Data(b"hello".to_vec().into())]);
}

#[tokio::test]
async fn test_streamed_message_arrives_in_order() {
    let (_connection, session, mut broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::new().write_buffer_size(4))
        .await
        .unwrap();

    let mut message = sender.begin_message().await.unwrap();
    message
        .set_header(Header {
            durable: true,
            ..Header::default()
        })
        .unwrap();
    message.write_all(b"0123456789").await.unwrap();
    assert!(message.set_header(Header::default()).is_err());
    message.close().await.unwrap();
    assert!(message.is_complete());

    let received = broker.received.recv().await.unwrap();
    let sections = decode_sections(&received).unwrap();
    assert!(matches!(&sections[0], Section::Header(header) if header.durable));
    assert_eq!(data_of(sections), b"0123456789");
    assert_eq!(
        message.tracker().settlement().await.unwrap(),
        Some(DeliveryState::Accepted)
    );
}

#[tokio::test]
async fn test_closing_short_of_declared_length_aborts() {
    let (_connection, session, mut broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .unwrap();

    let mut message = sender.begin_message().await.unwrap();
    message
        .open_body(OutputStreamOptions::new().body_length(8192))
        .unwrap();
    message.write_all(b"abcd").await.unwrap();
    message.close().await.unwrap();

    assert!(message.is_aborted());
    assert!(broker.aborted.recv().await.is_some());

    // The link is free for the next message.
    let tracker = sender.send(&b"next"[..]).await.unwrap();
    assert_eq!(
        tracker.settlement().await.unwrap(),
        Some(DeliveryState::Accepted)
    );
}

#[tokio::test]
async fn test_footer_after_body_close() {
    let (_connection, session, mut broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .unwrap();

    let mut message = sender.begin_message().await.unwrap();
    message
        .open_body(OutputStreamOptions::new().complete_send_on_close(false))
        .unwrap();
    message.write_all(b"payload").await.unwrap();
    message.close().await.unwrap();
    assert!(!message.is_complete());

    message
        .set_footer(vec![(
            sluice_codec::Value::symbol("checksum"),
            sluice_codec::Value::Uint(7),
        )])
        .unwrap();
    let tracker = message.complete().await.unwrap();
    tracker.settlement().await.unwrap();

    let received = broker.received.recv().await.unwrap();
    let sections = decode_sections(&received).unwrap();
    assert!(matches!(sections.last(), Some(Section::Footer(_))));
    assert_eq!(data_of(sections), b"payload");
}

#[tokio::test]
async fn test_send_times_out_without_credit() {
    let behaviour = Behaviour {
        credit: 0,
        ..Behaviour::default()
    };
    let (_connection, session, _broker) = connect(behaviour).await;
    let sender = session
        .open_sender(
            "queue",
            StreamSenderOptions::new().send_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let result = sender.send(&b"stuck"[..]).await;
    assert!(matches!(
        result,
        Err(ClientError::Engine(EngineError::OperationTimedOut(_)))
    ));
}

#[tokio::test]
async fn test_write_after_remote_close_is_io_error() {
    let (connection, session, broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .unwrap();
    let mut message = sender.begin_message().await.unwrap();

    broker
        .control
        .send(Box::new(|engine| {
            engine
                .close_connection(Some(ErrorCondition::new(
                    "amqp:connection:forced",
                    "shutting down",
                )))
                .unwrap();
        }))
        .unwrap();
    wait_for_failure(&connection).await;

    let err = message.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Other);
    let inner = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ClientError>())
        .unwrap();
    match inner {
        ClientError::Engine(EngineError::RemotelyClosed(Some(condition))) => {
            assert_eq!(condition.condition.as_str(), "amqp:connection:forced");
        }
        other => panic!("unexpected failure {:?}", other),
    }
    assert!(session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_refused_attach_reports_condition() {
    let behaviour = Behaviour {
        refuse_links: Some("amqp:not-found"),
        ..Behaviour::default()
    };
    let (_connection, session, _broker) = connect(behaviour).await;
    let result = session
        .open_sender("missing", StreamSenderOptions::default())
        .await;
    match result {
        Err(ClientError::Engine(EngineError::RemotelyClosed(Some(condition)))) => {
            assert_eq!(condition.condition.as_str(), "amqp:not-found");
        }
        other => panic!("expected a refusal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_receive_and_settle() {
    let (_connection, session, broker) = connect(Behaviour::default()).await;
    let receiver = session
        .open_receiver("queue", StreamReceiverOptions::default())
        .await
        .unwrap();

    broker.outbox.send(data_message(b"one")).unwrap();
    broker.outbox.send(data_message(b"two")).unwrap();

    let mut first = receiver.receive().await.unwrap();
    assert_eq!(&first.read_body().await.unwrap()[..], b"one");
    first.accept().await.unwrap();
    first.accept().await.unwrap();
    assert!(matches!(
        first.release().await,
        Err(ClientError::Engine(EngineError::IllegalState(_)))
    ));

    let mut second = receiver.receive().await.unwrap();
    assert_eq!(&second.read_body().await.unwrap()[..], b"two");
    second.accept().await.unwrap();

    assert!(receiver.try_receive().await.unwrap().is_none());
    assert!(receiver
        .receive_timeout(Duration::from_millis(20))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_large_message_streams_in_chunks() {
    let (_connection, session, broker) = connect(Behaviour::default()).await;
    let receiver = session
        .open_receiver("queue", StreamReceiverOptions::default())
        .await
        .unwrap();

    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    broker.outbox.send(data_message(&body)).unwrap();

    let mut delivery = receiver.receive().await.unwrap();
    let mut payload = BytesMut::new();
    let mut chunks = 0;
    while let Some(chunk) = delivery.read().await.unwrap() {
        payload.extend_from_slice(&chunk);
        chunks += 1;
    }
    assert!(chunks >= 1);
    assert_eq!(data_of(decode_sections(&payload).unwrap()), body);
    delivery.accept().await.unwrap();
}

#[tokio::test]
async fn test_credit_window_tops_up_as_deliveries_are_claimed() {
    let (_connection, session, broker) = connect(Behaviour::default()).await;
    let receiver = session
        .open_receiver("queue", StreamReceiverOptions::new().credit_window(4))
        .await
        .unwrap();
    assert_eq!(receiver.credit().await.unwrap(), 4);
    assert!(matches!(
        receiver.add_credit(1).await,
        Err(ClientError::Engine(EngineError::IllegalState(_)))
    ));

    for body in [&b"a"[..], b"b", b"c"] {
        broker.outbox.send(data_message(body)).unwrap();
    }
    while receiver.queued().await.unwrap() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(receiver.credit().await.unwrap(), 1);

    // One credit plus two waiting is over the prefetch ceiling.
    let mut deliveries = vec![receiver.receive().await.unwrap()];
    assert_eq!(receiver.credit().await.unwrap(), 1);

    // One credit plus one waiting is not; top back up to the window.
    deliveries.push(receiver.receive().await.unwrap());
    assert_eq!(receiver.credit().await.unwrap(), 3);

    deliveries.push(receiver.receive().await.unwrap());
    for delivery in &mut deliveries {
        delivery.read_to_end().await.unwrap();
        delivery.accept().await.unwrap();
    }
    assert_eq!(receiver.credit().await.unwrap(), 3);
}

#[tokio::test]
async fn test_drain_completes_when_peer_answers() {
    let (_connection, session, _broker) = connect(Behaviour::default()).await;
    let receiver = session
        .open_receiver("queue", StreamReceiverOptions::new().credit_window(0))
        .await
        .unwrap();

    receiver.add_credit(5).await.unwrap();
    receiver.drain().await.unwrap();
    assert_eq!(receiver.credit().await.unwrap(), 0);

    // Nothing to drain completes at once.
    receiver.drain().await.unwrap();
}

#[tokio::test]
async fn test_drain_times_out_and_link_stays_usable() {
    let behaviour = Behaviour {
        answer_drain: false,
        ..Behaviour::default()
    };
    let (_connection, session, _broker) = connect(behaviour).await;
    let receiver = session
        .open_receiver(
            "queue",
            StreamReceiverOptions::new()
                .credit_window(0)
                .drain_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    receiver.add_credit(3).await.unwrap();
    let result = receiver.drain().await;
    assert!(matches!(
        result,
        Err(ClientError::Engine(EngineError::OperationTimedOut(_)))
    ));
    receiver.add_credit(1).await.unwrap();
}

#[tokio::test]
async fn test_session_close_ends_its_links() {
    let (_connection, session, _broker) = connect(Behaviour::default()).await;
    let sender = session
        .open_sender("queue", StreamSenderOptions::default())
        .await
        .unwrap();

    session.close().await.unwrap();
    assert!(sender.begin_message().await.is_err());
}

#[tokio::test]
async fn test_connection_close_is_idempotent() {
    let (connection, session, _broker) = connect(Behaviour::default()).await;
    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert!(matches!(
        session
            .open_receiver("queue", StreamReceiverOptions::default())
            .await,
        Err(ClientError::ResourceClosed(_))
    ));
}
