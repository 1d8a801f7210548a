use super::*;
use crate::{
    provider_service::NewChannel,
    test_support::Harness,
    token::SessionCredential,
};
use shared::domain::ChatMode;

fn attributes() -> ChannelAttributes {
    ChannelAttributes {
        is_moderation_hub: false,
        is_moderation: false,
        moderation_completed: false,
        related_moderation_key: None,
        dm_members: None,
        auto_watch: false,
        creator: ProfileId::new("alice"),
        created_at: Utc::now(),
    }
}

fn dm_pair() -> Option<(ProfileId, ProfileId)> {
    Some((ProfileId::new("alice"), ProfileId::new("bob")))
}

#[test]
fn hub_flag_wins_over_dm_pair() {
    let mut attrs = attributes();
    attrs.is_moderation_hub = true;
    attrs.is_moderation = true;
    attrs.dm_members = dm_pair();

    let category = classify(&attrs, false);
    assert_eq!(category, ChatCategory::ModerationHub);
    assert!(category.is_private());
    assert!(!category.is_dm());
}

#[test]
fn moderation_wins_over_dm_pair() {
    let mut attrs = attributes();
    attrs.is_moderation = true;
    attrs.moderation_completed = true;
    attrs.related_moderation_key = Some("report-1".into());
    attrs.dm_members = dm_pair();

    assert_eq!(
        classify(&attrs, false),
        ChatCategory::ModerationSession {
            is_active: false,
            related_moderation_key: Some("report-1".into()),
        }
    );
}

#[test]
fn dm_pair_makes_a_direct_message() {
    let mut attrs = attributes();
    attrs.dm_members = dm_pair();

    let category = classify(&attrs, false);
    assert!(category.is_dm());
    assert!(category.is_private());
    assert!(!category.is_moderation());
    assert_eq!(
        category,
        ChatCategory::DirectMessage {
            member1: MemberDescriptor::unknown(ProfileId::new("alice")),
            member2: MemberDescriptor::unknown(ProfileId::new("bob")),
        }
    );
}

#[test]
fn plain_channel_keeps_its_privacy() {
    assert_eq!(
        classify(&attributes(), true),
        ChatCategory::General { is_private: true }
    );
    assert!(!classify(&attributes(), false).is_private());
}

#[tokio::test]
async fn announcements_channel_is_general_and_flagged() {
    let harness = Harness::new().await;
    let service = harness.provider_service();
    service
        .setup(
            &harness.conference_id,
            &ProfileId::new("alice"),
            &SessionCredential::new("alice"),
        )
        .await
        .expect("setup");
    let channel = service
        .create_channel(NewChannel {
            title: "Announcements".into(),
            is_private: false,
            invite: Vec::new(),
            mode: ChatMode::General,
            dm_members: None,
            related_moderation_key: None,
        })
        .await
        .expect("create");
    let other = service
        .create_channel(NewChannel {
            title: "Lobby".into(),
            is_private: false,
            invite: Vec::new(),
            mode: ChatMode::General,
            dm_members: None,
            related_moderation_key: None,
        })
        .await
        .expect("create");
    harness
        .storage
        .set_config_value(
            &harness.conference_id,
            ANNOUNCEMENTS_CHANNEL_KEY,
            channel.id().as_str(),
        )
        .await
        .expect("config");

    let converter = DescriptorConverter::new(
        harness.conference_id.clone(),
        Arc::new(harness.storage.clone()),
    );
    let descriptor = converter.convert(&channel, &service).await.expect("descriptor");
    assert!(descriptor.is_announcements);
    assert_eq!(descriptor.category, ChatCategory::General { is_private: false });
    assert_eq!(descriptor.friendly_name, "Announcements");
    assert_eq!(descriptor.creator, ProfileId::new("alice"));

    let other = converter.convert(&other, &service).await.expect("descriptor");
    assert!(!other.is_announcements);
}

#[tokio::test]
async fn channel_without_record_is_dropped() {
    let harness = Harness::new().await;
    let service = harness.provider_service();
    service
        .setup(
            &harness.conference_id,
            &ProfileId::new("alice"),
            &SessionCredential::new("alice"),
        )
        .await
        .expect("setup");
    let kept = service
        .create_channel(NewChannel {
            title: "kept".into(),
            is_private: false,
            invite: Vec::new(),
            mode: ChatMode::General,
            dm_members: None,
            related_moderation_key: None,
        })
        .await
        .expect("create");
    let orphan = service
        .create_channel(NewChannel {
            title: "orphan".into(),
            is_private: false,
            invite: Vec::new(),
            mode: ChatMode::General,
            dm_members: None,
            related_moderation_key: None,
        })
        .await
        .expect("create");
    harness
        .storage
        .delete_text_chat(orphan.id())
        .await
        .expect("drop record");

    let converter = DescriptorConverter::new(
        harness.conference_id.clone(),
        Arc::new(harness.storage.clone()),
    );
    assert!(converter.convert(&orphan, &service).await.is_none());

    let described = converter.convert_all(&[kept.clone(), orphan], &service).await;
    assert_eq!(described.len(), 1);
    assert_eq!(&described[0].id, kept.id());
}
