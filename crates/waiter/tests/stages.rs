#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{target, ScriptedAccessor};
use converge_core::predicates::{condition, field_non_empty};
use converge_waiter::{CancellationToken, Stage, WaitConfig, WaitOutcome, Waiter};
use serde_json::{json, Value};

fn issuer(ready: bool, uri: &str) -> Value {
    json!({
        "metadata": { "name": "test-acme-issuer", "namespace": "e2e" },
        "status": {
            "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }],
            "acme": { "uri": uri }
        }
    })
}

fn issuer_stages() -> Vec<Stage<Value>> {
    vec![
        Stage::new("issuer ready", condition("Ready", "True"), Duration::from_secs(10)),
        Stage::new("acme account registered", field_non_empty("status.acme.uri"), Duration::from_secs(3)),
    ]
}

#[tokio::test(start_paused = true)]
async fn stages_run_in_order() {
    let acc = ScriptedAccessor::new(vec![
        Ok(issuer(false, "")),
        Ok(issuer(true, "")),
        Ok(issuer(true, "")),
        Ok(issuer(true, "https://acme.test/acct/7")),
    ]);
    let waiter = Waiter::new(WaitConfig::new(Duration::from_secs(60), Duration::from_secs(1)));
    let obj = waiter
        .wait_stages(&acc, &target(), &issuer_stages(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obj["status"]["acme"]["uri"], "https://acme.test/acct/7");
    // Stage one: 2 fetches. Stage two starts fresh: 2 more.
    assert_eq!(acc.fetches(), 4);
}

#[tokio::test(start_paused = true)]
async fn failure_is_attributed_to_its_stage() {
    let acc = ScriptedAccessor::new(vec![Ok(issuer(true, ""))]);
    let waiter = Waiter::new(WaitConfig::new(Duration::from_secs(60), Duration::from_secs(1)));
    let failure = waiter
        .wait_stages(&acc, &target(), &issuer_stages(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.label, "acme account registered");
    match &failure.outcome {
        WaitOutcome::TimedOut { report, .. } => {
            // The second stage uses its own 3s budget, not the waiter's 60s.
            assert_eq!(report.elapsed, Duration::from_secs(3));
            assert_eq!(report.observed.as_deref(), Some("status.acme.uri=\"\""));
        }
        other => panic!("expected timeout, got {}", other.kind()),
    }
    let msg = failure.to_string();
    assert!(msg.starts_with("stage 2 (acme account registered) failed: timed out"), "{}", msg);
}

#[tokio::test(start_paused = true)]
async fn empty_stage_list_is_rejected() {
    let acc = ScriptedAccessor::new(vec![Ok(issuer(true, "x"))]);
    let failure = Waiter::default()
        .wait_stages(&acc, &target(), &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.outcome, WaitOutcome::Failed { .. }));
    assert_eq!(acc.fetches(), 0);
}

#[test]
fn stage_budget_overrides_only_the_timeout() {
    let waiter = Waiter::new(WaitConfig::new(Duration::from_secs(60), Duration::from_secs(1)));
    let staged = waiter.with_timeout(Duration::from_secs(3));
    assert_eq!(staged.config().timeout, Duration::from_secs(3));
    assert_eq!(staged.config().poll_interval, Duration::from_secs(1));
    assert_eq!(waiter.config().timeout, Duration::from_secs(60));
}
