use super::*;
use crate::{
    descriptor::ChatCategory,
    test_support::{CountingTokenBackend, FetchGate, Harness},
};
use futures::StreamExt;
use shared::protocol::{ChannelEvent, ServiceEvent};
use std::{sync::atomic::Ordering, time::Duration};
use tokio::sync::mpsc;

fn profile(name: &str) -> ProfileId {
    ProfileId::new(name)
}

async fn next_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("listener alive")
}

#[tokio::test]
async fn concurrent_setups_share_one_connection() {
    let harness = Harness::new().await;
    let manager = harness.manager("alice");

    let results = join_all((0..8).map(|_| manager.setup())).await;

    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(harness.provider.connect_attempts(), 1);
    assert_eq!(harness.tokens.fetches(), 1);
    assert_eq!(manager.connection_state().await, ServiceState::Connected);

    manager.setup().await.expect("already connected");
    assert_eq!(harness.provider.connect_attempts(), 1);
}

#[tokio::test]
async fn teardown_waits_for_pending_setup() {
    let gate = Arc::new(FetchGate::default());
    let harness = Harness::with_backend({
        let gate = Arc::clone(&gate);
        move |provider| {
            let mut backend = CountingTokenBackend::new(provider);
            backend.gate = Some(gate);
            backend
        }
    })
    .await;
    let manager = harness.manager("alice");

    let setup = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.setup().await }
    });
    gate.entered.notified().await;

    let teardown = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.teardown().await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!teardown.is_finished());

    gate.release.notify_one();
    setup.await.expect("join").expect("setup");
    teardown.await.expect("join").expect("teardown");

    assert_eq!(manager.connection_state().await, ServiceState::Uninitialized);
    assert_eq!(harness.provider.connect_attempts(), 1);
    assert_eq!(manager.get_is_user_online(&profile("alice")).await, None);
    gate.release.notify_one();
    let observer = harness.connected_manager("bob").await;
    assert_eq!(
        observer.get_is_user_online(&profile("alice")).await,
        Some(false)
    );
}

#[tokio::test]
async fn concurrent_teardowns_during_setup_shut_down_once() {
    let gate = Arc::new(FetchGate::default());
    let harness = Harness::with_backend({
        let gate = Arc::clone(&gate);
        move |provider| {
            let mut backend = CountingTokenBackend::new(provider);
            backend.gate = Some(gate);
            backend
        }
    })
    .await;
    let manager = harness.manager("alice");

    let setup = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.setup().await }
    });
    gate.entered.notified().await;

    let teardowns = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { join_all((0..4).map(|_| manager.teardown())).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!teardowns.is_finished());

    gate.release.notify_one();
    setup.await.expect("join").expect("setup");
    let results = teardowns.await.expect("join");

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(harness.provider.connect_attempts(), 1);
    assert_eq!(harness.provider.shutdowns(), 1);
    assert_eq!(manager.connection_state().await, ServiceState::Uninitialized);
}

#[tokio::test]
async fn setup_during_teardown_waits_then_reconnects() {
    let gate = Arc::new(FetchGate::default());
    let harness = Harness::with_backend({
        let gate = Arc::clone(&gate);
        move |provider| {
            let mut backend = CountingTokenBackend::new(provider);
            backend.gate = Some(gate);
            backend
        }
    })
    .await;
    let manager = harness.manager("alice");

    let first_setup = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.setup().await }
    });
    gate.entered.notified().await;
    let teardown = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.teardown().await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let second_setup = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.setup().await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!teardown.is_finished());
    assert!(!second_setup.is_finished());

    // The cached token normally serves the reconnect; the spare release covers a refetch.
    gate.release.notify_one();
    gate.release.notify_one();
    first_setup.await.expect("join").expect("first setup");
    teardown.await.expect("join").expect("teardown");
    second_setup.await.expect("join").expect("second setup");

    assert_eq!(harness.provider.connect_attempts(), 2);
    assert_eq!(harness.provider.shutdowns(), 1);
    assert_eq!(manager.connection_state().await, ServiceState::Connected);
    assert!(manager.create_chat(&[], false, "after").await.is_ok());
}

#[tokio::test]
async fn pager_from_before_teardown_reports_not_ready() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager
        .create_chat(&[], false, "history")
        .await
        .expect("chat");
    manager.send_message(&chat.id, "one").await.expect("send");
    let mut pager = manager.get_messages(&chat.id, None).await.expect("pager");

    manager.teardown().await.expect("teardown");

    assert_eq!(pager.next_page().await.err(), Some(ChatError::NotReady));
    assert_eq!(harness.provider.channel_count(), 1);
}

#[tokio::test]
async fn teardown_after_failed_pending_setup_is_clean() {
    let gate = Arc::new(FetchGate::default());
    let harness = Harness::with_backend({
        let gate = Arc::clone(&gate);
        move |provider| {
            let mut backend = CountingTokenBackend::new(provider);
            backend.gate = Some(gate);
            backend.fail.store(true, Ordering::SeqCst);
            backend
        }
    })
    .await;
    let manager = harness.manager("alice");

    let setup = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.setup().await }
    });
    gate.entered.notified().await;
    let teardown = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.teardown().await }
    });
    gate.release.notify_one();

    let err = setup.await.expect("join").err().expect("setup fails");
    assert!(matches!(err, ChatError::TokenUnavailable(_)));
    teardown.await.expect("join").expect("teardown");
    assert_eq!(manager.connection_state().await, ServiceState::Uninitialized);
    assert_eq!(harness.provider.connect_attempts(), 0);
}

#[tokio::test]
async fn setup_after_teardown_reconnects() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;

    manager.teardown().await.expect("teardown");
    manager.setup().await.expect("second setup");

    assert_eq!(manager.connection_state().await, ServiceState::Connected);
    assert_eq!(harness.provider.connect_attempts(), 2);
}

#[tokio::test]
async fn operations_before_setup_are_inert() {
    let harness = Harness::new().await;
    let manager = harness.manager("alice");
    let chat_id = ChatId::new("CH-1");

    assert!(manager.list_all_chats().await.is_empty());
    assert!(manager.list_watched_chats_unfiltered().await.is_empty());
    assert!(manager.get_chat(&chat_id).await.is_none());
    assert!(manager.get_messages(&chat_id, None).await.is_none());
    assert!(manager.get_moderation_hub_chat_id().await.is_none());
    assert_eq!(manager.get_is_user_online(&profile("alice")).await, None);
    assert_eq!(
        manager.send_message(&chat_id, "hi").await.err(),
        Some(ChatError::NotReady)
    );
    assert_eq!(
        manager.create_chat(&[], false, "lobby").await.err(),
        Some(ChatError::NotReady)
    );
}

#[tokio::test]
async fn setup_reports_mirror_status_and_mirrors_writes() {
    let harness = Harness::new().await;
    let manager = harness.manager("alice");

    let outcome = manager.setup().await.expect("setup");
    assert_eq!(outcome.mirror, MirrorStatus::Synced);

    let chat = manager
        .create_chat(&[], false, "lobby")
        .await
        .expect("create");
    manager.send_message(&chat.id, "hello").await.expect("send");
    manager.send_message(&chat.id, "again").await.expect("send");

    let snapshot = harness
        .storage
        .mirrored_channel_snapshot(&chat.id)
        .await
        .expect("query")
        .expect("snapshot");
    assert!(snapshot.contains("lobby"));
    assert_eq!(
        harness
            .storage
            .mirrored_message_count(&chat.id)
            .await
            .expect("count"),
        2
    );
}

#[tokio::test]
async fn setup_without_mirror_backend_skips_it() {
    let harness = Harness::new().await;
    let mut backends = harness.backends();
    backends.mirror = None;
    harness.provider.register_user(&profile("alice"));
    let manager = ChatSessionManager::new(
        harness.conference_id.clone(),
        profile("alice"),
        SessionCredential::new("alice"),
        backends,
        harness.options(),
    );

    let outcome = manager.setup().await.expect("setup");
    assert_eq!(outcome.mirror, MirrorStatus::Skipped);
    let chat = manager
        .create_chat(&[], false, "lobby")
        .await
        .expect("create works without mirror");
    assert!(harness
        .storage
        .mirrored_channel_snapshot(&chat.id)
        .await
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn private_chat_with_one_invitee_is_a_dm() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    harness.provider.register_user(&profile("bob"));

    let dm = manager
        .create_chat(&[profile("bob"), profile("alice")], true, "alice & bob")
        .await
        .expect("dm");
    assert_eq!(
        dm.category,
        ChatCategory::DirectMessage {
            member1: MemberDescriptor {
                profile_id: profile("alice"),
                is_online: Some(true),
            },
            member2: MemberDescriptor {
                profile_id: profile("bob"),
                is_online: Some(false),
            },
        }
    );
    assert_eq!(dm.creator, profile("alice"));

    harness.provider.set_presence(&profile("bob"), Some(true));
    let refreshed = manager.get_chat(&dm.id).await.expect("dm");
    assert!(matches!(
        refreshed.category,
        ChatCategory::DirectMessage { member2: MemberDescriptor { is_online: Some(true), .. }, .. }
    ));

    let with_stranger = manager
        .create_chat(&[profile("dave")], true, "alice & dave")
        .await
        .expect("dm with unknown user");
    assert_eq!(
        with_stranger.category,
        ChatCategory::DirectMessage {
            member1: MemberDescriptor {
                profile_id: profile("alice"),
                is_online: Some(true),
            },
            member2: MemberDescriptor::unknown(profile("dave")),
        }
    );

    let group = manager
        .create_chat(&[profile("bob"), profile("carol")], true, "trio")
        .await
        .expect("group");
    assert_eq!(group.category, ChatCategory::General { is_private: true });

    let public = manager
        .create_chat(&[profile("bob")], false, "open")
        .await
        .expect("public");
    assert_eq!(public.category, ChatCategory::General { is_private: false });
}

#[tokio::test]
async fn listings_partition_chats_by_category() {
    let harness = Harness::new().await;
    let alice = harness.connected_manager("alice").await;
    let bob = harness.connected_manager("bob").await;

    let lobby = alice.create_chat(&[], false, "lobby").await.expect("lobby");
    let dm = alice
        .create_chat(&[profile("bob")], true, "dm")
        .await
        .expect("dm");
    let moderation = alice
        .create_moderation_chat(&[profile("m1")], Some("report-1".into()), None)
        .await
        .expect("moderation");
    let hub = alice
        .create_moderation_hub_chat("Moderators")
        .await
        .expect("hub");
    let bobs_room = bob.create_chat(&[], false, "bob's room").await.expect("room");

    let ids = |chats: Vec<ChatDescriptor>| chats.into_iter().map(|c| c.id).collect::<Vec<_>>();

    assert_eq!(
        ids(alice.list_all_chats().await),
        vec![lobby.id.clone(), dm.id.clone(), bobs_room.id.clone()]
    );
    assert_eq!(
        ids(alice.list_watched_chats().await),
        vec![lobby.id.clone(), dm.id.clone()]
    );
    assert_eq!(
        ids(alice.list_all_moderation_chats().await),
        vec![moderation.id.clone()]
    );
    assert_eq!(
        ids(alice.list_all_watched_moderation_chats().await),
        vec![moderation.id.clone()]
    );
    assert_eq!(
        ids(alice.list_watched_chats_unfiltered().await),
        vec![lobby.id, dm.id, moderation.id, hub.id]
    );
    assert!(bob.list_all_moderation_chats().await.is_empty());
}

#[tokio::test]
async fn channels_without_records_are_not_listed() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");

    harness
        .storage
        .delete_text_chat(&chat.id)
        .await
        .expect("drop record");

    assert!(manager.list_all_chats().await.is_empty());
    assert!(manager.get_chat(&chat.id).await.is_none());
}

#[tokio::test]
async fn moderation_chat_lifecycle() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;

    let chat = manager
        .create_moderation_chat(
            &[profile("m1"), profile("m2")],
            Some("report-42".into()),
            Some("please review"),
        )
        .await
        .expect("create");
    assert_eq!(
        chat.category,
        ChatCategory::ModerationSession {
            is_active: true,
            related_moderation_key: Some("report-42".into()),
        }
    );
    assert!(chat.is_private());
    assert_eq!(manager.get_chat_members_count(&chat.id).await, Some(3));

    let mut pager = manager.get_messages(&chat.id, None).await.expect("pager");
    let page = pager.next_page().await.expect("page").expect("messages");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].body, "please review");

    manager
        .mark_moderation_chat_completed(&chat.id)
        .await
        .expect("complete");
    let reloaded = manager.get_chat(&chat.id).await.expect("chat");
    assert_eq!(
        reloaded.category,
        ChatCategory::ModerationSession {
            is_active: false,
            related_moderation_key: Some("report-42".into()),
        }
    );

    assert_eq!(
        manager
            .mark_moderation_chat_completed(&ChatId::new("CH-missing"))
            .await
            .err(),
        Some(ChatError::ChannelNotFound(ChatId::new("CH-missing")))
    );
}

#[tokio::test]
async fn only_moderation_chats_can_be_completed() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let lobby = manager
        .create_chat(&[profile("bob")], false, "lobby")
        .await
        .expect("chat");

    assert_eq!(
        manager.mark_moderation_chat_completed(&lobby.id).await.err(),
        Some(ChatError::NotAModerationChat(lobby.id.clone()))
    );
    let reloaded = manager.get_chat(&lobby.id).await.expect("chat");
    assert_eq!(reloaded.category, ChatCategory::General { is_private: false });
    assert!(manager.list_all_moderation_chats().await.is_empty());
}

#[tokio::test]
async fn only_one_moderation_hub_per_conference() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    assert!(manager.get_moderation_hub_chat_id().await.is_none());

    let hub = manager
        .create_moderation_hub_chat("Moderators")
        .await
        .expect("hub");
    assert!(hub.is_moderation_hub());
    assert!(hub.is_private());

    assert_eq!(
        manager.create_moderation_hub_chat("Again").await.err(),
        Some(ChatError::ModerationHubExists(harness.conference_id.clone()))
    );
    assert_eq!(harness.provider.channel_count(), 1);
    assert_eq!(manager.get_moderation_hub_chat_id().await, Some(hub.id.clone()));
    assert_eq!(
        manager.get_moderation_hub_chat().await.map(|chat| chat.id),
        Some(hub.id)
    );
}

#[tokio::test]
async fn pager_walks_history_backwards() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");
    for n in 0..5 {
        manager
            .send_message(&chat.id, &format!("m{n}"))
            .await
            .expect("send");
    }
    let bodies = |page: Vec<ChatMessage>| page.into_iter().map(|m| m.body).collect::<Vec<_>>();

    let mut pager = manager.get_messages(&chat.id, None).await.expect("pager");
    assert_eq!(pager.chat_id(), &chat.id);
    assert_eq!(
        bodies(pager.next_page().await.expect("page").expect("some")),
        vec!["m3", "m4"]
    );
    assert_eq!(
        bodies(pager.next_page().await.expect("page").expect("some")),
        vec!["m1", "m2"]
    );
    assert_eq!(
        bodies(pager.next_page().await.expect("page").expect("some")),
        vec!["m0"]
    );
    assert!(pager.next_page().await.expect("page").is_none());

    pager.restart();
    assert_eq!(
        bodies(pager.next_page().await.expect("page").expect("some")),
        vec!["m3", "m4"]
    );

    let pages = manager
        .get_messages(&chat.id, Some(3))
        .await
        .expect("pager")
        .into_stream()
        .collect::<Vec<_>>()
        .await;
    let pages = pages
        .into_iter()
        .map(|page| bodies(page.expect("page")))
        .collect::<Vec<_>>();
    assert_eq!(pages, vec![vec!["m2", "m3", "m4"], vec!["m0", "m1"]]);
}

#[tokio::test]
async fn empty_chat_has_no_pages() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "quiet").await.expect("create");

    let mut pager = manager.get_messages(&chat.id, None).await.expect("pager");
    assert!(pager.next_page().await.expect("page").is_none());
}

#[tokio::test]
async fn messages_and_reactions() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");
    let sent = manager.send_message(&chat.id, "hello").await.expect("send");

    let fetched = manager
        .get_message(&chat.id, &sent.message_id, sent.index)
        .await
        .expect("message");
    assert_eq!(fetched.body, "hello");
    assert!(manager
        .get_message(&chat.id, &MessageId::new("MSG-missing"), 0)
        .await
        .is_none());

    let ack = manager
        .add_reaction(&chat.id, &sent.message_id, "+1")
        .await
        .expect("ack");
    assert_eq!(ack.reaction, "+1");
    assert_eq!(ack.message_id, sent.message_id);
    let reacted = manager
        .get_message(&chat.id, &sent.message_id, sent.index)
        .await
        .expect("message");
    assert_eq!(reacted.reactions.get("+1"), Some(&vec![profile("alice")]));

    assert!(manager
        .remove_reaction(&chat.id, &sent.message_id, "+1")
        .await
        .is_some());
    assert!(manager
        .remove_reaction(&chat.id, &sent.message_id, "+1")
        .await
        .is_none());
    assert!(manager
        .add_reaction(&chat.id, &MessageId::new("MSG-missing"), "+1")
        .await
        .is_none());
}

#[tokio::test]
async fn private_chat_refuses_outsiders() {
    let harness = Harness::new().await;
    let bob = harness.connected_manager("bob").await;
    let alice = harness.connected_manager("alice").await;
    let secret = bob
        .create_chat(&[profile("carol")], true, "secret")
        .await
        .expect("create");

    assert!(matches!(
        alice.send_message(&secret.id, "let me in").await,
        Err(ChatError::PermissionDenied(_))
    ));
    assert!(alice.get_chat(&secret.id).await.is_none());
    assert!(alice.list_chat_members(&secret.id).await.is_empty());
}

#[tokio::test]
async fn delete_chat_is_best_effort() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");
    manager.send_message(&chat.id, "bye").await.expect("send");

    manager.delete_chat(&ChatId::new("CH-missing")).await;
    assert_eq!(harness.provider.channel_count(), 1);

    manager.delete_chat(&chat.id).await;
    assert_eq!(harness.provider.channel_count(), 0);
    assert!(manager.get_chat(&chat.id).await.is_none());
    assert!(harness
        .storage
        .text_chat(&chat.id)
        .await
        .expect("query")
        .is_none());
    assert_eq!(
        harness
            .storage
            .mirrored_message_count(&chat.id)
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn members_presence_and_invites() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    harness.provider.register_user(&profile("bob"));
    let chat = manager
        .create_chat(&[profile("bob")], false, "lobby")
        .await
        .expect("create");

    assert_eq!(
        manager.list_chat_members(&chat.id).await,
        vec![
            MemberDescriptor {
                profile_id: profile("alice"),
                is_online: Some(true),
            },
            MemberDescriptor {
                profile_id: profile("bob"),
                is_online: Some(false),
            },
        ]
    );

    manager
        .invite_users(&chat.id, &[profile("carol")])
        .await
        .expect("invite");
    assert_eq!(manager.get_chat_members_count(&chat.id).await, Some(3));
    let members = manager.list_chat_members(&chat.id).await;
    assert_eq!(members[2].profile_id, profile("carol"));
    assert_eq!(members[2].is_online, None);

    assert_eq!(
        manager.get_chat_members_count(&ChatId::new("CH-missing")).await,
        None
    );
}

#[tokio::test]
async fn online_statuses_leave_out_unknown_users() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    harness.provider.register_user(&profile("bob"));

    let statuses = manager
        .online_statuses(&[profile("alice"), profile("bob"), profile("ghost")])
        .await
        .expect("not superseded");

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses.get(&profile("alice")), Some(&true));
    assert_eq!(statuses.get(&profile("bob")), Some(&false));
    assert!(!statuses.contains_key(&profile("ghost")));
}

#[tokio::test]
async fn auto_watch_and_read_position() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");
    assert!(!chat.auto_watch_enabled);

    manager.enable_auto_watch(&chat.id).await.expect("enable");
    assert!(manager.get_chat(&chat.id).await.expect("chat").auto_watch_enabled);
    manager.disable_auto_watch(&chat.id).await.expect("disable");
    assert!(!manager.get_chat(&chat.id).await.expect("chat").auto_watch_enabled);
    assert_eq!(
        manager.enable_auto_watch(&ChatId::new("CH-missing")).await,
        Err(ChatError::ChannelNotFound(ChatId::new("CH-missing")))
    );

    assert_eq!(manager.get_last_read_index(&chat.id).await, None);
    manager
        .set_last_read_index(&chat.id, Some(3))
        .await
        .expect("set");
    assert_eq!(manager.get_last_read_index(&chat.id).await, Some(3));
    manager
        .set_last_read_index(&chat.id, None)
        .await
        .expect("reset");
    assert_eq!(manager.get_last_read_index(&chat.id).await, None);
}

#[tokio::test]
async fn channel_listener_receives_only_its_kind() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: ChannelListener = Arc::new(move |event: ChannelEvent| {
        let _ = tx.send(event);
    });
    let subscription = manager
        .channel_event_on(&chat.id, ChannelEventKind::MessageAdded, listener)
        .await
        .expect("subscribe");
    assert_eq!(manager.active_subscriptions(), 1);

    harness.provider.simulate_typing(&chat.id, &profile("bob"));
    let sent = manager.send_message(&chat.id, "ping").await.expect("send");

    match next_within(&mut rx).await {
        ChannelEvent::MessageAdded { message } => assert_eq!(message, sent),
        other => panic!("unexpected event {other:?}"),
    }

    manager.channel_event_off(&subscription);
    manager.channel_event_off(&subscription);
    assert_eq!(manager.active_subscriptions(), 0);
}

#[tokio::test]
async fn unsubscribe_after_chat_removal_is_harmless() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: ChannelListener = Arc::new(move |event: ChannelEvent| {
        let _ = tx.send(event);
    });
    let subscription = manager
        .channel_event_on(&chat.id, ChannelEventKind::ChannelRemoved, listener)
        .await
        .expect("subscribe");

    manager.delete_chat(&chat.id).await;
    assert_eq!(
        next_within(&mut rx).await,
        ChannelEvent::ChannelRemoved {
            chat_id: chat.id.clone()
        }
    );

    manager.channel_event_off(&subscription);
    assert_eq!(manager.active_subscriptions(), 0);
    assert!(matches!(
        manager
            .channel_event_on(&chat.id, ChannelEventKind::MessageAdded, Arc::new(|_: ChannelEvent| {}))
            .await,
        Err(ChatError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn service_listener_sees_presence_changes() {
    let harness = Harness::new().await;
    let alice = harness.connected_manager("alice").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: ServiceListener = Arc::new(move |event: ServiceEvent| {
        let _ = tx.send(event);
    });
    let subscription = alice
        .service_event_on(ServiceEventKind::UserUpdated, listener)
        .await
        .expect("subscribe");

    let _bob = harness.connected_manager("bob").await;
    assert_eq!(
        next_within(&mut rx).await,
        ServiceEvent::UserUpdated {
            profile_id: profile("bob"),
            is_online: Some(true),
        }
    );

    alice.service_event_off(&subscription);
    assert_eq!(alice.active_subscriptions(), 0);
}

#[tokio::test]
async fn teardown_drops_every_subscription() {
    let harness = Harness::new().await;
    let manager = harness.connected_manager("alice").await;
    let chat = manager.create_chat(&[], false, "lobby").await.expect("create");

    let _channel = manager
        .channel_event_on(&chat.id, ChannelEventKind::MessageAdded, Arc::new(|_: ChannelEvent| {}))
        .await
        .expect("channel subscription");
    let service = manager
        .service_event_on(ServiceEventKind::UserUpdated, Arc::new(|_: ServiceEvent| {}))
        .await
        .expect("service subscription");
    assert_eq!(manager.active_subscriptions(), 2);

    manager.teardown().await.expect("teardown");

    assert_eq!(manager.active_subscriptions(), 0);
    manager.service_event_off(&service);
    assert!(matches!(
        manager
            .service_event_on(ServiceEventKind::UserUpdated, Arc::new(|_: ServiceEvent| {}))
            .await,
        Err(ChatError::NotReady)
    ));
}
