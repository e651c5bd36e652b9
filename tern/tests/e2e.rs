//! End-to-end tests: SMTP in, mailbox or relay out.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::time::Duration;

use support::{SmtpCommand, TestHarness, harness};
use tern_mailbox::{Message, MessageStore};

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn authenticated_local_delivery() {
    let harness = TestHarness::builder().build().await.unwrap();

    let reply = harness
        .send_email(
            "user@example.com",
            &["friend@example.com"],
            "Subject: Hi\r\n\r\nBody",
        )
        .await
        .unwrap();

    assert_eq!(reply.code, 250);
    assert_eq!(reply.message(), "OK Message accepted for delivery");

    let inbox = harness.inbox("friend@example.com").await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject(), "Hi");
    assert_eq!(inbox[0].from(), "user@example.com");

    // Nothing was relayed
    assert_eq!(harness.running().engine().stats().queued, 0);
    assert!(harness.mock_commands().await.is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn remote_recipient_is_relayed() {
    let harness = TestHarness::builder().build().await.unwrap();

    let reply = harness
        .send_email(
            "user@example.com",
            &["someone@relay.test"],
            "Subject: Onwards\r\n\r\nTravelling mail\r\n",
        )
        .await
        .unwrap();
    assert_eq!(reply.code, 250);

    let content = harness
        .wait_for_delivery(Duration::from_secs(5))
        .await
        .unwrap();
    let content = String::from_utf8(content).unwrap();
    assert!(content.contains("Subject: Onwards"));
    assert!(content.contains("Travelling mail"));

    let commands = harness.mock_commands().await;
    assert!(commands.contains(&SmtpCommand::Ehlo("mx.test".to_string())));
    assert!(commands.contains(&SmtpCommand::MailFrom("user@example.com".to_string())));
    assert!(commands.contains(&SmtpCommand::RcptTo("someone@relay.test".to_string())));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn mixed_recipients_split_between_inbox_and_relay() {
    let harness = TestHarness::builder().build().await.unwrap();

    harness
        .send_email(
            "user@example.com",
            &["friend@example.com", "someone@relay.test"],
            "Subject: Both\r\n\r\nFor everyone\r\n",
        )
        .await
        .unwrap();

    assert_eq!(harness.inbox("friend@example.com").await.unwrap().len(), 1);

    harness
        .wait_for_delivery(Duration::from_secs(5))
        .await
        .unwrap();

    let rcpts: Vec<SmtpCommand> = harness
        .mock_commands()
        .await
        .into_iter()
        .filter(|command| matches!(command, SmtpCommand::RcptTo(_)))
        .collect();
    assert_eq!(rcpts, vec![SmtpCommand::RcptTo("someone@relay.test".to_string())]);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn mail_requires_authentication() {
    let harness = TestHarness::builder().build().await.unwrap();
    let mut client = harness.connect().await.unwrap();

    client.ehlo("client.test").await.unwrap();
    let mail = client.mail_from("user@example.com").await.unwrap();
    assert_eq!(mail.code, 530);

    let auth = TestHarness::authenticate(&mut client, harness::USER, "wrong")
        .await
        .unwrap();
    assert_eq!(auth.code, 535);

    let auth = TestHarness::authenticate(&mut client, harness::USER, harness::PASSWORD)
        .await
        .unwrap();
    assert_eq!(auth.code, 235);
    assert_eq!(client.mail_from("user@example.com").await.unwrap().code, 250);

    client.quit().await.unwrap();
    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn unauthenticated_relay_denied() {
    let harness = TestHarness::builder()
        .with_require_auth(false)
        .build()
        .await
        .unwrap();
    let mut client = harness.connect().await.unwrap();

    client.ehlo("client.test").await.unwrap();
    assert_eq!(client.mail_from("stranger@elsewhere.test").await.unwrap().code, 250);

    let remote = client.rcpt_to("someone@relay.test").await.unwrap();
    assert_eq!(remote.code, 550);
    assert_eq!(remote.message(), "5.7.1 Relay access denied");

    let local = client.rcpt_to("friend@example.com").await.unwrap();
    assert_eq!(local.code, 250);

    client.quit().await.unwrap();
    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn shutdown_notifies_connected_clients() {
    let harness = TestHarness::builder().build().await.unwrap();
    let mut client = harness.connect().await.unwrap();
    client.ehlo("client.test").await.unwrap();

    let registry = std::sync::Arc::clone(harness.running().registry());
    assert_eq!(registry.active_count(), 1);

    harness.shutdown().await.unwrap();

    let farewell = client.read_response().await.unwrap();
    assert_eq!(farewell.code, 421);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Network operations not supported in MIRI")]
async fn spooled_message_relayed_after_restart() {
    let mut leftover = Message::new(
        "user@example.com",
        vec!["someone@relay.test".to_string()],
        b"Subject: Unfinished\r\n\r\nFrom last time\r\n".to_vec(),
    );
    leftover.assign_id("MSG202401010000000000001");

    let harness = TestHarness::builder()
        .with_leftover(leftover)
        .build()
        .await
        .unwrap();

    let content = harness
        .wait_for_delivery(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(String::from_utf8(content).unwrap().contains("From last time"));

    let commands = harness.mock_commands().await;
    assert!(commands.contains(&SmtpCommand::RcptTo("someone@relay.test".to_string())));

    let spool = std::sync::Arc::clone(harness.running().spool());
    let mut remaining = spool.ids().await.unwrap();
    for _ in 0..100 {
        if remaining.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = spool.ids().await.unwrap();
    }
    assert!(remaining.is_empty());

    harness.shutdown().await.unwrap();
}
