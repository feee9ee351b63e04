mod common;

use common::{amount, Harness, CHANNEL};
use rust_decimal_macros::dec;
use taskmarket::domain::account::Balance;
use taskmarket::domain::check::NewCheck;
use taskmarket::domain::ledger::LedgerReason;
use taskmarket::error::MarketError;

#[tokio::test]
async fn test_multi_check_pays_each_user_once() {
    let h = Harness::new();
    h.funded(1, dec!(300)).await;
    for user in 2..=5 {
        h.funded(user, dec!(0)).await;
    }
    let check = h
        .market
        .create_check(1, NewCheck::multi(amount(dec!(300)), 3))
        .await
        .unwrap();
    assert_eq!(check.amount_per_activation, Balance::new(dec!(100)));
    assert_eq!(check.code.len(), 10);
    assert_eq!(h.market.get_user_balance(1).await.unwrap().balance, Balance::ZERO);

    let credited = h.market.activate_check(2, &check.code, None).await.unwrap();
    assert_eq!(credited, Balance::new(dec!(100)));
    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::AlreadyActivated(_))
    ));
    // Codes are case-insensitive.
    let found = h
        .market
        .get_check_by_code(&check.code.to_lowercase())
        .await
        .unwrap();
    assert_eq!(found.id, check.id);
    h.market
        .activate_check(3, &check.code.to_lowercase(), None)
        .await
        .unwrap();
    h.market.activate_check(4, &check.code, None).await.unwrap();
    assert!(matches!(
        h.market.activate_check(5, &check.code, None).await,
        Err(MarketError::NoActivationsRemaining(_))
    ));

    let check = h.market.get_check(check.id).await.unwrap();
    assert_eq!(check.current_activations, 3);
    assert!(!check.is_active);
    assert_eq!(check.escrow(), Balance::ZERO);
    assert_eq!(h.market.activations_for_check(check.id).await.unwrap().len(), 3);
    for user in 2..=4 {
        assert_eq!(h.market.get_user_balance(user).await.unwrap().balance, Balance::new(dec!(100)));
    }
}

#[tokio::test]
async fn test_rounding_dust_returns_to_creator() {
    let h = Harness::new();
    h.funded(1, dec!(100)).await;
    for user in 2..=4 {
        h.funded(user, dec!(0)).await;
    }
    let check = h
        .market
        .create_check(1, NewCheck::multi(amount(dec!(100)), 3))
        .await
        .unwrap();
    assert_eq!(check.amount_per_activation, Balance::new(dec!(33)));

    for user in 2..=4 {
        h.market.activate_check(user, &check.code, None).await.unwrap();
    }
    assert_eq!(h.market.get_user_balance(1).await.unwrap().balance, Balance::new(dec!(1)));
    let check = h.market.get_check(check.id).await.unwrap();
    assert_eq!(check.refunded_amount, Balance::new(dec!(1)));
    let last = h.market.ledger_history(1).await.unwrap().pop().unwrap();
    assert_eq!(last.reason, LedgerReason::CheckRefund);
}

#[tokio::test]
async fn test_password_and_target_gates() {
    let h = Harness::new();
    h.funded(1, dec!(100)).await;
    h.funded(2, dec!(0)).await;
    h.funded(3, dec!(0)).await;

    let locked = h
        .market
        .create_check(1, NewCheck::personal(amount(dec!(10))).with_password("sesame"))
        .await
        .unwrap();
    assert!(locked.password_hash.as_deref().unwrap().starts_with("$argon2"));
    assert!(matches!(
        h.market.activate_check(2, &locked.code, Some("wrong")).await,
        Err(MarketError::InvalidPassword)
    ));
    assert!(matches!(
        h.market.activate_check(2, &locked.code, None).await,
        Err(MarketError::InvalidPassword)
    ));
    // A failed password leaves no activation behind.
    assert!(h.market.activations_for_check(locked.id).await.unwrap().is_empty());
    h.market
        .activate_check(2, &locked.code, Some("sesame"))
        .await
        .unwrap();

    let addressed = h
        .market
        .create_check(1, NewCheck::personal(amount(dec!(10))).for_user(3))
        .await
        .unwrap();
    assert!(matches!(
        h.market.activate_check(2, &addressed.code, None).await,
        Err(MarketError::NotForYou(_))
    ));
    h.market.activate_check(3, &addressed.code, None).await.unwrap();

    assert!(matches!(
        h.market.activate_check(3, "NOSUCHCODE", None).await,
        Err(MarketError::NotFound { entity: "check", .. })
    ));
}

#[tokio::test]
async fn test_required_subscription() {
    let h = Harness::new();
    h.funded(1, dec!(100)).await;
    h.funded(2, dec!(0)).await;
    let mut draft = NewCheck::multi(amount(dec!(20)), 2);
    draft.required_subscription = Some(CHANNEL.to_string());
    let check = h.market.create_check(1, draft).await.unwrap();

    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::SubscriptionRequired(channel)) if channel == CHANNEL
    ));
    h.verifier.mark_unreadable(CHANNEL).await;
    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::Verifier(_))
    ));
    h.verifier.repair(CHANNEL).await;
    h.verifier.grant_membership(2, CHANNEL).await;
    assert_eq!(
        h.market.activate_check(2, &check.code, None).await.unwrap(),
        Balance::new(dec!(10))
    );
}

#[tokio::test]
async fn test_create_check_validation() {
    let h = Harness::new();
    h.funded(1, dec!(5)).await;

    let cases = [
        NewCheck::multi(amount(dec!(5)), 1),
        NewCheck::multi(amount(dec!(5)), 10),
        NewCheck::personal(amount(dec!(0.5))),
        NewCheck::personal(amount(dec!(5))).with_password("abc"),
        NewCheck::multi(amount(dec!(5)), 2).for_user(2),
    ];
    for draft in cases {
        assert!(matches!(
            h.market.create_check(1, draft).await,
            Err(MarketError::ValidationError(_))
        ));
    }
    assert!(matches!(
        h.market.create_check(1, NewCheck::personal(amount(dec!(6)))).await,
        Err(MarketError::InsufficientFunds { .. })
    ));
    assert!(h.market.checks_for_creator(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expiry_refunds_remaining_escrow() {
    let h = Harness::new();
    h.funded(1, dec!(100)).await;
    h.funded(2, dec!(0)).await;
    let mut draft = NewCheck::multi(amount(dec!(100)), 3);
    draft.ttl_hours = Some(1);
    let check = h.market.create_check(1, draft).await.unwrap();
    h.market.activate_check(2, &check.code, None).await.unwrap();

    h.advance_minutes(60);
    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::CheckExpired(_))
    ));
    let report = h.market.sweep().await.unwrap();
    assert_eq!(report.expired_checks.len(), 1);
    assert_eq!(report.expired_checks[0].refunded, Balance::new(dec!(67)));
    assert!(h.market.sweep().await.unwrap().expired_checks.is_empty());

    assert_eq!(h.market.get_user_balance(1).await.unwrap().balance, Balance::new(dec!(67)));
    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::CheckExpired(_))
    ));
}

#[tokio::test]
async fn test_cancel_by_creator_only() {
    let h = Harness::new();
    h.funded(1, dec!(50)).await;
    h.funded(2, dec!(0)).await;
    let check = h
        .market
        .create_check(1, NewCheck::multi(amount(dec!(50)), 5))
        .await
        .unwrap();
    h.market.activate_check(2, &check.code, None).await.unwrap();

    assert!(matches!(
        h.market.cancel_check(2, check.id).await,
        Err(MarketError::ValidationError(_))
    ));
    assert_eq!(h.market.cancel_check(1, check.id).await.unwrap(), Balance::new(dec!(40)));
    assert!(matches!(
        h.market.cancel_check(1, check.id).await,
        Err(MarketError::CheckInactive(_))
    ));
    assert!(matches!(
        h.market.activate_check(2, &check.code, None).await,
        Err(MarketError::CheckInactive(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activation_is_at_most_once() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    for user in 2..=21 {
        h.funded(user, dec!(0)).await;
    }
    let check = h
        .market
        .create_check(1, NewCheck::multi(amount(dec!(50)), 5))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for user in 2..=21 {
        // Every user tries twice.
        for _ in 0..2 {
            let market = h.market.clone();
            let code = check.code.clone();
            handles.push(tokio::spawn(async move {
                market.activate_check(user, &code, None).await.is_ok()
            }));
        }
    }
    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 5);
    let activations = h.market.activations_for_check(check.id).await.unwrap();
    assert_eq!(activations.len(), 5);
    let check = h.market.get_check(check.id).await.unwrap();
    assert_eq!(check.current_activations, 5);
    assert!(!check.is_active);
    assert_eq!(h.market.get_user_balance(1).await.unwrap().balance, Balance::new(dec!(950)));
}
