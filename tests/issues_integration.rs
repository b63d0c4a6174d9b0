//! Integration tests for the issue connectors against a mock tracker.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::config::{IssueSourceConfig, SecretRef, TestStepSourceConfig};
use harvester_core::connector::{CrawlContext, JqlOptions, Sources, TargetSpec};
use harvester_core::{ConnectorError, OutputStore, RetryPolicy};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn literal(value: &str) -> SecretRef {
    SecretRef::Literal(value.to_string())
}

fn issue_source(server: &MockServer) -> IssueSourceConfig {
    IssueSourceConfig {
        base_url: server.uri(),
        user: literal("bot@acme.test"),
        token: literal("token"),
        custom_fields: Vec::new(),
    }
}

fn context(temp_dir: &TempDir, sources: Sources) -> CrawlContext {
    CrawlContext {
        group: "tickets".to_string(),
        output: Arc::new(OutputStore::new(temp_dir.path())),
        retry: RetryPolicy::new(0, Duration::from_millis(1)),
        sources: Arc::new(sources),
    }
}

fn raw_issue(n: usize) -> Value {
    json!({
        "id": format!("{}", 10_000 + n),
        "key": format!("ENG-{n}"),
        "fields": {
            "summary": format!("Story {n}"),
            "issuetype": { "name": "Story" },
            "project": { "id": "77", "name": "Engineering" },
            "labels": [],
            "created": "2024-01-01T00:00:00.000+0000",
            "updated": "2024-02-01T00:00:00.000+0000"
        },
        "renderedFields": {}
    })
}

async fn mount_search_page(server: &MockServer, jql: &str, start_at: usize, issues: Vec<Value>, total: usize) {
    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .and(query_param("jql", jql))
        .and(query_param("startAt", start_at.to_string()))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "startAt": start_at,
            "maxResults": 50,
            "total": total,
            "issues": issues
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_search_follows_server_page_size_to_total() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let jql = "project = ENG";

    // The server caps pages at 50 although 100 is requested.
    mount_search_page(&server, jql, 0, (0..50).map(raw_issue).collect(), 125).await;
    mount_search_page(&server, jql, 50, (50..100).map(raw_issue).collect(), 125).await;
    mount_search_page(&server, jql, 100, (100..125).map(raw_issue).collect(), 125).await;

    let ctx = context(
        &temp_dir,
        Sources {
            issues: Some(issue_source(&server)),
            ..Sources::default()
        },
    );
    let spec = TargetSpec::IssueJql {
        queries: vec![jql.to_string()],
        options: JqlOptions::default(),
    };
    let report = spec.crawl(&ctx).await.expect("crawl should succeed");
    assert_eq!(report.emitted, 125);

    let records = ctx.output.read_metadata_records("tickets").await.unwrap();
    assert_eq!(records.len(), 125);
    assert_eq!(records[0].id, "ENG-0");
    assert_eq!(records[124].id, "ENG-124");
    assert_eq!(records[7].struct_data.title, "[ENG-7] Story 7");
    assert_eq!(
        records[7].struct_data.web_url,
        format!("{}/browse/ENG-7", server.uri())
    );
    assert_eq!(records[7].file_name(), "issues ENG-7.html");
    assert_eq!(
        records[7].struct_data.extra["updatedAt"],
        "2024-02-01T00:00:00.000+0000"
    );
}

#[tokio::test]
async fn test_failed_query_is_counted_and_next_query_runs() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .and(query_param("jql", "project = BROKEN"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;
    mount_search_page(&server, "project = ENG", 0, (0..2).map(raw_issue).collect(), 2).await;

    let ctx = context(
        &temp_dir,
        Sources {
            issues: Some(issue_source(&server)),
            ..Sources::default()
        },
    );
    let spec = TargetSpec::IssueJql {
        queries: vec!["project = BROKEN".to_string(), "project = ENG".to_string()],
        options: JqlOptions::default(),
    };
    let report = spec.crawl(&ctx).await.expect("second query should still run");
    assert_eq!(report.emitted, 2);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_issue_body_has_fields_steps_then_comments() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let jql = "key = QA-1";

    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "startAt": 0,
            "maxResults": 100,
            "total": 1,
            "issues": [{
                "id": "5001",
                "key": "QA-1",
                "fields": {
                    "summary": "Login works",
                    "issuetype": { "name": "Test" },
                    "project": { "id": "88", "name": "Quality" },
                    "labels": ["smoke", "auth"],
                    "created": "2024-01-01T00:00:00.000+0000",
                    "updated": "2024-01-02T00:00:00.000+0000"
                },
                "renderedFields": { "description": "<p>Check the login form</p>" }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/3/issue/QA-1/comment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "startAt": 0,
            "maxResults": 100,
            "total": 1,
            "comments": [{
                "author": { "displayName": "Dana" },
                "renderedBody": "<p>Passed on staging</p>",
                "created": "2024-01-03T00:00:00.000+0000",
                "updated": "2024-01-04T00:00:00.000+0000"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/connect/public/rest/api/1.0/teststep/5001"))
        .and(query_param("projectId", "88"))
        .and(header_exists("authorization"))
        .and(header_exists("zapiaccesskey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "orderId": 2, "step": "Submit", "data": null, "result": "Dashboard shown" },
            { "orderId": 1, "step": "Open /login", "data": "user=demo", "result": "" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context(
        &temp_dir,
        Sources {
            issues: Some(issue_source(&server)),
            test_steps: Some(TestStepSourceConfig {
                base_url: format!("{}/connect", server.uri()),
                account_id: literal("acct"),
                access_key: literal("access"),
                secret_key: literal("secret"),
            }),
            ..Sources::default()
        },
    );
    let spec = TargetSpec::IssueJql {
        queries: vec![jql.to_string()],
        options: JqlOptions {
            include_comments: true,
            include_test_steps: true,
        },
    };
    let report = spec.crawl(&ctx).await.expect("crawl should succeed");
    assert_eq!(report.emitted, 1);

    let body = std::fs::read_to_string(temp_dir.path().join("tickets").join("issues QA-1.html"))
        .expect("issue file should exist");
    assert!(body.starts_with("Issue Key: QA-1\n\nIssue Type: Test\n\nTitle: Login works"));
    assert!(body.contains("Labels: smoke, auth"));
    assert!(body.contains("Description: \n<p>Check the login form</p>"));

    let steps_at = body.find("Test Scenarios:").expect("steps section");
    let comments_at = body.find("Comments:").expect("comments section");
    assert!(steps_at < comments_at);
    let first_step = body.find("Open /login").unwrap();
    let second_step = body.find("Submit").unwrap();
    assert!(first_step < second_step, "steps sorted by order id");
    assert!(body.contains("Comment Author: Dana"));
    assert!(body.ends_with("=====\n"));
}

#[tokio::test]
async fn test_test_steps_without_section_fails_target() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let ctx = context(
        &temp_dir,
        Sources {
            issues: Some(issue_source(&server)),
            ..Sources::default()
        },
    );
    let spec = TargetSpec::IssueJql {
        queries: vec!["project = ENG".to_string()],
        options: JqlOptions {
            include_comments: false,
            include_test_steps: true,
        },
    };
    let err = spec.crawl(&ctx).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::MissingSource {
            section: "test_steps"
        }
    ));
}

#[tokio::test]
async fn test_epic_summary_lists_stories_and_skips_empty_epics() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    let epic = |key: &str, title: &str| {
        json!({
            "id": "1",
            "key": key,
            "fields": {
                "summary": title,
                "issuetype": { "name": "Epic" },
                "project": { "id": "77", "name": "Engineering" },
                "created": "2024-01-01T00:00:00.000+0000",
                "updated": "2024-01-01T00:00:00.000+0000"
            }
        })
    };
    let search = |issues: Value| {
        let total = issues.as_array().map_or(0, Vec::len);
        ResponseTemplate::new(200).set_body_json(json!({
            "startAt": 0,
            "maxResults": 100,
            "total": total,
            "issues": issues
        }))
    };

    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .and(query_param("jql", "project = \"ENG\" AND issuetype = Epic"))
        .respond_with(search(json!([epic("ENG-1", "Checkout"), epic("ENG-2", "Empty")])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .and(query_param("jql", "parent = \"ENG-1\""))
        .respond_with(search(json!([raw_issue(10), raw_issue(11)])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/3/search"))
        .and(query_param("jql", "parent = \"ENG-2\""))
        .respond_with(search(json!([])))
        .mount(&server)
        .await;

    let ctx = context(
        &temp_dir,
        Sources {
            issues: Some(issue_source(&server)),
            ..Sources::default()
        },
    );
    let spec = TargetSpec::IssueEpicSummary {
        projects: vec!["ENG".to_string()],
    };
    let report = spec.crawl(&ctx).await.unwrap();
    assert_eq!(report.emitted, 1);
    assert_eq!(report.skipped, 1);

    let records = ctx.output.read_metadata_records("tickets").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].struct_data.title, "[ENG-1] Epic: Checkout");

    let body = std::fs::read_to_string(temp_dir.path().join("tickets").join("issues ENG-1.html"))
        .unwrap();
    assert!(body.starts_with("Epic ID: ENG-1\nEpic Title: Checkout\n=====\nListing of User Stories:\n\n"));
    assert!(body.contains("ENG-10: Story 10 [Last Updated On: 2024-02-01T00:00:00.000+0000]\n"));
    assert!(body.contains("ENG-11: Story 11"));
}
