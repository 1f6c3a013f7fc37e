//! Caller-facing validation, cancellation and purge.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_dispatch::{Clock, EventKind, ManualClock, SubmitError};
use courier_store::{MediaRef, OwnerId, Platform, PostState, Store};

use common::*;

async fn twitter_harness() -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    Harness::new(vec![
        ScriptedAdapter::new(Platform::Twitter, clock.clone()),
        ScriptedAdapter::new(Platform::Instagram, clock),
    ])
    .await
}

#[tokio::test]
async fn test_submit_persists_scheduled_post() {
    let harness = twitter_harness().await;
    let mut sub = harness.subscribe();

    let mut request = harness.new_post(&[Platform::Twitter, Platform::Instagram], "Base copy");
    request.media_refs = vec![MediaRef::new("media/1.png")];
    request
        .variants
        .insert("instagram".to_string(), "Insta copy #photo".to_string());
    let post_id = harness.courier.submit_post(request).await.unwrap();

    let view = harness.courier.get_post(harness.owner, post_id).await.unwrap();
    assert_eq!(view.post.state, PostState::Scheduled);
    assert!(view.attempts.is_empty());
    assert_eq!(view.post.content_for(Platform::Twitter), "Base copy");
    assert_eq!(view.post.content_for(Platform::Instagram), "Insta copy #photo");
    assert_eq!(view.post.timezone, "Europe/Berlin");

    let events = events(&mut sub);
    assert_eq!(kinds(&events, post_id), vec![EventKind::Scheduled]);
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let harness = twitter_harness().await;

    let mut past = harness.new_post(&[Platform::Twitter], "Late");
    past.scheduled_at = harness.clock.now();
    assert!(matches!(
        harness.courier.submit_post(past).await,
        Err(SubmitError::InvalidSchedule(_))
    ));

    let mut unknown = harness.new_post(&[Platform::Twitter], "Where?");
    unknown.platforms.push("myspace".to_string());
    assert!(matches!(
        harness.courier.submit_post(unknown).await,
        Err(SubmitError::UnknownPlatform(tag)) if tag == "myspace"
    ));

    let empty = harness.new_post(&[Platform::Twitter], "   ");
    assert!(matches!(
        harness.courier.submit_post(empty).await,
        Err(SubmitError::InvalidInput(_))
    ));

    let no_platforms = harness.new_post(&[], "Nowhere");
    assert!(matches!(
        harness.courier.submit_post(no_platforms).await,
        Err(SubmitError::InvalidInput(_))
    ));

    let mut bad_zone = harness.new_post(&[Platform::Twitter], "Zoned");
    bad_zone.timezone = "Mars/Olympus_Mons".to_string();
    assert!(matches!(
        harness.courier.submit_post(bad_zone).await,
        Err(SubmitError::InvalidInput(_))
    ));

    let mut stray_variant = harness.new_post(&[Platform::Twitter], "Variant");
    stray_variant.variants = BTreeMap::from([("linkedin".to_string(), "Hi".to_string())]);
    assert!(matches!(
        harness.courier.submit_post(stray_variant).await,
        Err(SubmitError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_submit_requires_connected_account() {
    let harness = twitter_harness().await;
    let request = harness.new_post(&[Platform::Facebook], "Unconnected");
    assert!(matches!(
        harness.courier.submit_post(request).await,
        Err(SubmitError::NoActiveAccount(Platform::Facebook))
    ));
}

#[tokio::test]
async fn test_pre_validation_rejects_up_front() {
    let harness = twitter_harness().await;

    let mut request = harness.new_post(&[Platform::Instagram], "Caption only");
    request.pre_validate = true;
    assert!(matches!(
        harness.courier.submit_post(request).await,
        Err(SubmitError::ValidationRejected(Platform::Instagram, reason)) if reason == "media_required"
    ));

    let mut request = harness.new_post(&[Platform::Twitter], &"x".repeat(281));
    request.pre_validate = true;
    assert!(matches!(
        harness.courier.submit_post(request).await,
        Err(SubmitError::ValidationRejected(Platform::Twitter, reason)) if reason == "content_too_long"
    ));

    // Without pre-validation the same post is accepted and fails at publish.
    let request = harness.new_post(&[Platform::Instagram], "Caption only");
    assert!(harness.courier.submit_post(request).await.is_ok());
}

#[tokio::test]
async fn test_cancel_scheduled_post_once() {
    let harness = twitter_harness().await;
    let mut sub = harness.subscribe();
    let post_id = harness.submit(&[Platform::Twitter], "Changed my mind").await;

    harness.courier.cancel_post(harness.owner, post_id).await.unwrap();
    harness.courier.cancel_post(harness.owner, post_id).await.unwrap();

    let post = harness.store.get_post(post_id).await.unwrap();
    assert_eq!(post.state, PostState::Cancelled);

    // The scheduler never picks it up.
    harness.fire().await;
    assert!(harness.dispatcher.queue().is_empty());
    assert!(harness.store.attempts_for(post_id).await.unwrap().is_empty());

    let events = events(&mut sub);
    assert_eq!(
        kinds(&events, post_id),
        vec![EventKind::Scheduled, EventKind::PostCancelled]
    );
}

#[tokio::test]
async fn test_cancel_finished_post_is_refused() {
    let harness = twitter_harness().await;
    let post_id = harness.submit(&[Platform::Twitter], "Done").await;
    harness.fire().await;
    harness.drain().await;

    assert!(matches!(
        harness.courier.cancel_post(harness.owner, post_id).await,
        Err(SubmitError::NotCancellable(PostState::Posted))
    ));
}

#[tokio::test]
async fn test_other_owners_cannot_see_or_cancel() {
    let harness = twitter_harness().await;
    let post_id = harness.submit(&[Platform::Twitter], "Mine").await;
    let stranger = OwnerId::new();

    assert!(matches!(
        harness.courier.get_post(stranger, post_id).await,
        Err(SubmitError::NotFound)
    ));
    assert!(matches!(
        harness.courier.cancel_post(stranger, post_id).await,
        Err(SubmitError::NotFound)
    ));
}

#[tokio::test]
async fn test_purge_only_finished_posts() {
    let harness = twitter_harness().await;
    let post_id = harness.submit(&[Platform::Twitter], "Ephemeral").await;

    assert!(matches!(
        harness.courier.purge_post(harness.owner, post_id).await,
        Err(SubmitError::NotTerminal(PostState::Scheduled))
    ));

    harness.fire().await;
    harness.drain().await;
    harness.courier.purge_post(harness.owner, post_id).await.unwrap();

    assert!(matches!(
        harness.courier.get_post(harness.owner, post_id).await,
        Err(SubmitError::NotFound)
    ));
    assert!(harness.store.attempts_for(post_id).await.unwrap().is_empty());
}
