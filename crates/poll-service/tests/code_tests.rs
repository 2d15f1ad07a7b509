//! Session code allocation through the service: collisions with live and
//! stored polls, exhaustion, and lookup normalization.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use common::types::SessionCode;
use poll_service::code::SessionCodeGenerator;
use poll_service::errors::PollError;
use poll_service::ledger::VoteLedger;
use poll_service::service::PollService;
use poll_test_utils::{
    account, code, coffee_or_tea, service_with_codes, test_settings, test_voting_secret,
    MemoryPollStore,
};

#[tokio::test]
async fn test_live_code_is_never_reissued() {
    let service = service_with_codes(&["AB23CD", "AB23CD", "XY7ZAB"]);

    let first = service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap();
    let second = service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap();

    assert_eq!(first.session_code.as_str(), "AB23CD");
    assert_eq!(second.session_code.as_str(), "XY7ZAB");
}

#[tokio::test]
async fn test_stored_code_is_never_reissued() {
    let stored = VoteLedger::new(code("AB23CD"), coffee_or_tea(account("someone")), Utc::now());
    let store = MemoryPollStore::new().with_record(stored.to_record());

    let service = PollService::builder(test_voting_secret())
        .settings(test_settings())
        .store(store.shared())
        .code_generator(SessionCodeGenerator::from_sequence([
            code("AB23CD"),
            code("XY7ZAB"),
        ]))
        .build()
        .unwrap();

    let poll = service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap();
    assert_eq!(poll.session_code.as_str(), "XY7ZAB");

    // The stored poll is untouched
    assert_eq!(
        store.get(&code("AB23CD")).unwrap().created_by,
        account("someone")
    );
}

#[tokio::test]
async fn test_exhausted_codes_fail_creation() {
    let service = service_with_codes(&["AB23CD"]);
    service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap();

    let err = service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap_err();
    assert!(matches!(err, PollError::Internal(_)));
    assert_eq!(service.status().await.live_polls, 1);
}

#[tokio::test]
async fn test_lookup_accepts_loose_input() {
    let service = service_with_codes(&["AB23CD"]);
    service
        .create_poll(coffee_or_tea(account("owner")))
        .await
        .unwrap();

    let typed = SessionCode::parse(" ab23cd ").unwrap();
    let poll = service.get_poll(&typed).await.unwrap();
    assert_eq!(poll.session_code.as_str(), "AB23CD");
}

#[test]
fn test_ambiguous_characters_are_rejected() {
    for raw in ["AB12CD", "ABO3CD", "AB23C", "AB23CDE", "AB-3CD"] {
        assert!(SessionCode::parse(raw).is_err(), "{raw} should not parse");
    }
}
