//! End-to-end engine tests over the scripted provider.

use crate::cancellation::AbortSignal;
use crate::engine::PipelineEngine;
use crate::errors::EngineError;
use crate::events::{CollectingSink, EngineEvent};
use crate::provider::ToolRegistry;
use crate::testing::{EchoTool, MockProvider};
use crate::verification::ClaimStatus;
use crate::workflow::{StageDef, WorkflowDefinition};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn engine(provider: Arc<MockProvider>) -> PipelineEngine {
    PipelineEngine::new(provider, Arc::new(ToolRegistry::new()))
}

fn inputs(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn gather_analyze() -> WorkflowDefinition {
    WorkflowDefinition::new("analysis")
        .with_stage(StageDef::new("gather", "Gather data on {ticker}"))
        .with_stage(StageDef::new("analyze", "Analyze this: {gather}").with_dependency("gather"))
}

#[tokio::test]
async fn test_two_stage_run_orders_events_and_wires_outputs() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("gathered facts");
    provider.push_text("final analysis");
    let engine = engine(provider.clone());
    let sink = Arc::new(CollectingSink::new());
    engine.events().subscribe(sink.clone());

    let result = engine
        .run(
            &gather_analyze(),
            &inputs(&[("ticker", json!("ACME"))]),
            5.0,
            AbortSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stages_completed, 2);
    assert!(!result.partial);
    assert_eq!(result.primary_output.as_deref(), Some("final analysis"));
    assert_eq!(result.outputs["gather"], "gathered facts");
    assert!(result.total_cost_usd > 0.0);

    // The second request's prompt embeds the first stage's output.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].messages[0].content.contains("gathered facts"));

    // gather settles completely before analyze starts.
    let events = sink.events();
    let positions: Vec<usize> = [
        ("gather", "start"),
        ("gather", "complete"),
        ("analyze", "start"),
        ("analyze", "complete"),
    ]
    .iter()
    .map(|(stage, kind)| {
        events
            .iter()
            .position(|e| match (e, *kind) {
                (EngineEvent::StageStart { name, .. }, "start") => name == stage,
                (EngineEvent::StageComplete { name, .. }, "complete") => name == stage,
                _ => false,
            })
            .unwrap()
    })
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::PipelineComplete { partial: false, .. })
    ));
}

#[tokio::test]
async fn test_independent_stages_run_concurrently() {
    let provider = Arc::new(MockProvider::new());
    provider.set_delay(Duration::from_millis(150));
    let workflow = WorkflowDefinition::new("fanout")
        .with_stage(StageDef::new("a", "pa"))
        .with_stage(StageDef::new("b", "pb"))
        .with_stage(StageDef::new("c", "pc"));
    let engine = engine(provider);

    let started = Instant::now();
    let result = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.stages_completed, 3);
    assert!(!result.partial);
    // Three 150ms calls in one level take one call's worth of wall
    // time, not three.
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
}

#[tokio::test]
async fn test_failure_skips_transitive_dependents() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("a output");
    provider.push_error("model refused the request");
    let workflow = WorkflowDefinition::new("chain")
        .with_stage(StageDef::new("a", "pa"))
        .with_stage(StageDef::new("b", "pb {a}").with_dependency("a"))
        .with_stage(StageDef::new("c", "pc {b}").with_dependency("b"));
    let engine = engine(provider.clone());
    let sink = Arc::new(CollectingSink::new());
    engine.events().subscribe(sink.clone());

    let result = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(result.stages_completed, 1);
    assert_eq!(result.failed_stages, vec!["b"]);
    assert_eq!(result.skipped_stages, vec!["c"]);
    assert!(result.partial);
    // c never reached the provider.
    assert_eq!(provider.call_count(), 2);
    assert_eq!(sink.stage_events("b").len(), 2); // start + error
    assert!(matches!(
        sink.events().last(),
        Some(EngineEvent::PipelineComplete { partial: true, .. })
    ));
}

#[tokio::test]
async fn test_pre_aborted_run_skips_everything() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine(provider.clone());
    let abort = AbortSignal::new();
    abort.abort("user cancelled");

    let result = engine
        .run(&gather_analyze(), &HashMap::new(), 5.0, abort)
        .await
        .unwrap();

    assert_eq!(result.stages_completed, 0);
    assert!(result.partial);
    assert_eq!(result.skipped_stages, vec!["gather", "analyze"]);
    assert_eq!(result.total_cost_usd, 0.0);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_budget_exhaustion_halts_the_run() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine(provider.clone());

    // Far below any single stage's reservation.
    let result = engine
        .run(&gather_analyze(), &HashMap::new(), 0.0001, AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(result.stages_completed, 0);
    assert_eq!(result.failed_stages, vec!["gather"]);
    assert_eq!(result.skipped_stages, vec!["analyze"]);
    assert!(result.partial);
    assert_eq!(result.total_cost_usd, 0.0);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_missing_required_tool_rejects_the_run() {
    let provider = Arc::new(MockProvider::new());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool));
    registry.register_group("market_data", ["echo"]);
    let engine = PipelineEngine::new(provider.clone(), registry);
    let sink = Arc::new(CollectingSink::new());
    engine.events().subscribe(sink.clone());

    let workflow = WorkflowDefinition::new("gated")
        .with_required_tool("market_data")
        .with_required_tool("filings")
        .with_stage(StageDef::new("a", "p"));

    let err = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap_err();

    match err {
        EngineError::ToolsUnavailable { missing } => assert_eq!(missing, vec!["filings"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(sink.events().contains(&EngineEvent::ToolUnavailable {
        name: "filings".to_string(),
        required: true,
    }));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_missing_optional_tool_only_warns() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("done");
    let engine = engine(provider);
    let sink = Arc::new(CollectingSink::new());
    engine.events().subscribe(sink.clone());

    let workflow = WorkflowDefinition::new("soft")
        .with_optional_tool("filings")
        .with_stage(StageDef::new("a", "p"));

    let result = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(result.stages_completed, 1);
    assert!(sink.events().contains(&EngineEvent::ToolUnavailable {
        name: "filings".to_string(),
        required: false,
    }));
}

#[tokio::test]
async fn test_tool_loop_feeds_results_back() {
    let provider = Arc::new(MockProvider::new());
    provider.push_tool_call("echo", json!({"ticker": "ACME"}));
    provider.push_text("answer built from echo");
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool));
    registry.register_group("market_data", ["echo"]);
    let engine = PipelineEngine::new(provider.clone(), registry);

    let workflow = WorkflowDefinition::new("tooled")
        .with_required_tool("market_data")
        .with_stage(StageDef::new("a", "look up {ticker}").with_tool("market_data"));

    let result = engine
        .run(
            &workflow,
            &inputs(&[("ticker", json!("ACME"))]),
            5.0,
            AbortSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.primary_output.as_deref(), Some("answer built from echo"));
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    // Second round carries the echoed tool result back to the model.
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == "tool" && m.content.contains("ACME")));
    assert!(!requests[0].tools.is_empty());
}

#[tokio::test]
async fn test_verify_stage_produces_report() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("Revenue of $50 billion was reported by Acme.");
    provider.push_text("Acme revenue reached $50 billion.");
    // Extraction call made by the verifier.
    provider.push_text(
        json!([
            {"text": "Acme revenue reached $50 billion", "category": "metric", "value": 50e9, "unit": "USD"}
        ])
        .to_string(),
    );
    let engine = engine(provider.clone());
    let sink = Arc::new(CollectingSink::new());
    engine.events().subscribe(sink.clone());

    let workflow = WorkflowDefinition::new("verified-analysis")
        .with_stage(StageDef::new("gather", "Collect revenue data"))
        .with_stage(
            StageDef::new("verify_claims", "Check: {gather}")
                .with_dependency("gather")
                .with_agent_type("verify"),
        );

    let result = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap();

    let report = result.verification.expect("verification report");
    assert_eq!(report.verified, 1);
    assert_eq!(report.claims[0].status, ClaimStatus::Verified);
    assert_eq!(report.claims[0].source_value, Some(50_000_000_000.0));
    assert!(report.annotated_text.contains("[^claim-1]"));
    assert!(sink.events().contains(&EngineEvent::VerificationComplete {
        name: "verify_claims".to_string(),
    }));

    // The extraction call is budgeted like any stage call: three
    // provider calls, three entries in the ledger, and the spend of
    // all three in the run's total.
    assert_eq!(provider.call_count(), 3);
    assert_eq!(result.total_calls, 3);
    // Default pricing for claude-sonnet-4 with the mock's 100/50 usage.
    let per_call = (100.0 * 3.0 + 50.0 * 15.0) / 1e6;
    assert!((result.total_cost_usd - 3.0 * per_call).abs() < 1e-12);

    // The settle event carries the report.
    let events = sink.events();
    match events.last() {
        Some(EngineEvent::PipelineComplete {
            report: Some(report),
            partial: false,
            ..
        }) => assert_eq!(report.verified, 1),
        other => panic!("expected a settle event with a report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_verification_degrades_when_budget_cannot_cover_extraction() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("Revenue of $50 billion was reported by Acme.");
    provider.push_text("Acme revenue reached $50 billion.");
    let engine = engine(provider.clone());

    // Big enough for both stage reservations, too small for the
    // extraction call's reservation on top of the stage spend.
    let workflow = WorkflowDefinition::new("tight-verify")
        .with_stage(StageDef::new("gather", "Collect revenue data"))
        .with_stage(
            StageDef::new("verify_claims", "Check: {gather}")
                .with_dependency("gather")
                .with_agent_type("verify"),
        );

    let result = engine
        .run(&workflow, &HashMap::new(), 0.02, AbortSignal::new())
        .await
        .unwrap();

    // Verification is advisory: the run completes, the extraction call
    // was never made, and the report is empty rather than an error.
    assert!(!result.partial);
    assert_eq!(result.stages_completed, 2);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.total_calls, 2);
    let report = result.verification.expect("verification report");
    assert!(report.claims.is_empty());
}

#[tokio::test]
async fn test_verify_stage_sees_same_level_sibling_evidence() {
    let provider = Arc::new(MockProvider::new());
    // Sub-workflow stages run before the level's agent stages, so the
    // scripted order is deterministic.
    provider.push_text("Acme revenue reached $50 billion in the filing.");
    provider.push_text("Revenue was $50 billion.");
    provider.push_text(
        json!([
            {"text": "Revenue was $50 billion", "category": "metric", "value": 50e9, "unit": "USD"}
        ])
        .to_string(),
    );
    let engine = engine(provider);

    let nested = WorkflowDefinition::new("filing")
        .with_stage(StageDef::new("dig", "Pull the revenue figure"));
    let workflow = WorkflowDefinition::new("level-mates")
        .with_stage(StageDef::sub_workflow("research", nested))
        .with_stage(StageDef::new("verify_claims", "State the revenue").with_agent_type("verify"));

    let result = engine
        .run(&workflow, &HashMap::new(), 5.0, AbortSignal::new())
        .await
        .unwrap();

    // The verify stage and "research" share a level; its claim still
    // links against the sibling's output.
    let report = result.verification.expect("verification report");
    assert_eq!(report.verified, 1);
    assert_eq!(report.claims[0].sources[0].label, "research");
}

#[tokio::test]
async fn test_sub_workflow_shares_budget_and_returns_primary() -> anyhow::Result<()> {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("inner first");
    provider.push_text("inner final");
    provider.push_text("outer summary built on inner final");

    let nested = WorkflowDefinition::new("inner")
        .with_stage(StageDef::new("collect", "collect {topic}"))
        .with_stage(StageDef::new("digest", "digest {collect}").with_dependency("collect"));
    let workflow = WorkflowDefinition::new("outer")
        .with_stage(StageDef::sub_workflow("research", nested))
        .with_stage(StageDef::new("summary", "summarize {research}").with_dependency("research"));

    let engine = engine(provider.clone());
    let result = engine
        .run(
            &workflow,
            &inputs(&[("topic", json!("widgets"))]),
            5.0,
            AbortSignal::new(),
        )
        .await?;

    assert_eq!(result.stages_completed, 2);
    assert_eq!(result.outputs["research"], "inner final");
    assert_eq!(
        result.primary_output.as_deref(),
        Some("outer summary built on inner final")
    );
    // Nested stage costs land on the shared run tracker.
    assert_eq!(result.total_calls, 3);
    assert!(result.total_cost_usd > 0.0);
    // The summary prompt saw the sub-workflow's primary output.
    let requests = provider.requests();
    assert!(requests[2].messages[0].content.contains("inner final"));
    Ok(())
}

#[test]
fn test_cyclic_workflow_rejected_before_execution() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine(provider.clone());
    let workflow = WorkflowDefinition::new("cyclic")
        .with_stage(StageDef::new("a", "pa").with_dependency("b"))
        .with_stage(StageDef::new("b", "pb").with_dependency("a"));

    let err = tokio_test::block_on(engine.run(
        &workflow,
        &HashMap::new(),
        5.0,
        AbortSignal::new(),
    ))
    .unwrap_err();
    assert!(matches!(err, EngineError::Cycle(_)));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_mid_run_abort_skips_later_levels() {
    let provider = Arc::new(MockProvider::new());
    provider.set_delay(Duration::from_millis(100));
    let engine = Arc::new(engine(provider));
    let abort = AbortSignal::new();

    let run = {
        let engine = engine.clone();
        let abort = abort.clone();
        let workflow = gather_analyze();
        tokio::spawn(async move {
            engine
                .run(&workflow, &HashMap::new(), 5.0, abort)
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    abort.abort("operator stop");
    let result = run.await.unwrap();

    assert!(result.partial);
    assert!(result.stages_completed <= 1);
    assert!(result.skipped_stages.contains(&"analyze".to_string()));
}
