//! Integration tests for the wiki connectors against a mock wiki API.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::config::{SecretRef, WikiSourceConfig};
use harvester_core::connector::{CrawlContext, Sources, TargetSpec, WikiOptions, WikiPageOptions};
use harvester_core::{OutputStore, RetryPolicy};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context(server: &MockServer, temp_dir: &TempDir) -> CrawlContext {
    CrawlContext {
        group: "docs".to_string(),
        output: Arc::new(OutputStore::new(temp_dir.path())),
        retry: RetryPolicy::new(0, Duration::from_millis(1)),
        sources: Arc::new(Sources {
            wiki: Some(WikiSourceConfig {
                base_url: server.uri(),
                user: SecretRef::Literal("bot@acme.test".to_string()),
                token: SecretRef::Literal("token".to_string()),
                item_delay_ms: 0,
            }),
            ..Sources::default()
        }),
    }
}

async fn mount_children(server: &MockServer, page_id: &str, children: &[&str]) {
    let results: Vec<_> = children.iter().map(|id| json!({ "id": id })).collect();
    Mock::given(method("GET"))
        .and(path(format!("/wiki/api/v2/pages/{page_id}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": results,
            "_links": {}
        })))
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, page_id: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/wiki/api/v2/pages/{page_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": page_id,
            "title": format!("Page {page_id}"),
            "spaceId": "900",
            "body": { "storage": { "value": body } },
            "version": { "createdAt": "2024-03-01T10:00:00.000Z" },
            "_links": { "webui": format!("/spaces/ENG/pages/{page_id}/Page+{page_id}") }
        })))
        .mount(server)
        .await;
}

async fn mount_space(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/spaces/900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "900",
            "key": "ENG",
            "name": "Engineering"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_child_expansion_minus_excluded_root() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    mount_children(&server, "100", &["101", "102"]).await;
    mount_children(&server, "101", &[]).await;
    mount_children(&server, "102", &[]).await;
    mount_page(&server, "101", "<p>first child</p>").await;
    mount_page(&server, "102", "<p>second child</p>").await;
    mount_space(&server).await;
    // The excluded root must never be fetched.
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages/100"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let ctx = context(&server, &temp_dir);
    let spec = TargetSpec::WikiPages {
        page_ids: vec!["100".to_string()],
        options: WikiPageOptions {
            include_child_pages: true,
            exclude_pages: vec!["100".to_string()],
            ..WikiPageOptions::default()
        },
    };
    let report = spec.crawl(&ctx).await.expect("crawl should succeed");
    assert_eq!(report.emitted, 2);
    assert_eq!(report.failed, 0);

    let records = ctx
        .output
        .read_metadata_records("docs")
        .await
        .expect("metadata log should be readable");
    let mut ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["101", "102"]);

    let first = records.iter().find(|r| r.id == "101").expect("record for 101");
    assert_eq!(first.file_name(), "ENG 101.html");
    assert_eq!(first.struct_data.title, "Page 101");
    assert_eq!(
        first.struct_data.web_url,
        format!("{}/wiki/spaces/ENG/pages/101", server.uri())
    );
    assert_eq!(first.struct_data.extra["spaceName"], "Engineering");

    let body = std::fs::read_to_string(temp_dir.path().join("docs").join("ENG 101.html"))
        .expect("page file should exist");
    assert_eq!(body, "<p>first child</p>");
}

#[tokio::test]
async fn test_referenced_attachments_are_filtered_then_downloaded() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    mount_page(
        &server,
        "200",
        r#"<ac:link><ri:attachment ri:filename="manual.pdf" /></ac:link>
<ac:image><ri:attachment ri:filename="diagram.png" /></ac:image>
<ac:link><ri:attachment ri:filename="secret-plan.pdf" /></ac:link>"#,
    )
    .await;
    mount_space(&server).await;

    let attachment = |id: &str, title: &str, file_id: &str| {
        json!({
            "id": id,
            "title": title,
            "mediaType": "application/octet-stream",
            "pageId": "200",
            "fileId": file_id,
            "webuiLink": format!("/spaces/ENG/pages/200/{title}"),
            "downloadLink": format!("/download/attachments/200/{title}"),
            "version": { "createdAt": "2024-03-02T00:00:00.000Z" }
        })
    };
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages/200/attachments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                attachment("att1", "manual.pdf", "f-1"),
                attachment("att2", "diagram.png", "f-2"),
                attachment("att3", "secret-plan.pdf", "f-3"),
                attachment("att4", "unreferenced.pdf", "f-4"),
            ],
            "_links": {}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wiki/download/attachments/200/manual.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context(&server, &temp_dir);
    let spec = TargetSpec::WikiPages {
        page_ids: vec!["200".to_string()],
        options: WikiPageOptions {
            banned_attachment_patterns: vec!["secret".to_string()],
            ..WikiPageOptions::default()
        },
    };
    let report = spec.crawl(&ctx).await.expect("crawl should succeed");
    assert_eq!(report.emitted, 2, "page plus one attachment");
    assert_eq!(report.skipped, 2, "unsupported type and banned name");

    let records = ctx.output.read_metadata_records("docs").await.unwrap();
    assert_eq!(records.len(), 2);
    let manual = records.iter().find(|r| r.id == "att1").expect("attachment record");
    assert_eq!(manual.file_name(), "ENG f-1.pdf");
    assert_eq!(manual.content.mime_type, "application/pdf");
    let bytes = std::fs::read(temp_dir.path().join("docs").join("ENG f-1.pdf")).unwrap();
    assert_eq!(bytes, b"%PDF-1.7");
}

#[tokio::test]
async fn test_missing_wiki_section_fails_target() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let ctx = CrawlContext {
        group: "docs".to_string(),
        output: Arc::new(OutputStore::new(temp_dir.path())),
        retry: RetryPolicy::default(),
        sources: Arc::new(Sources::default()),
    };
    let spec = TargetSpec::WikiPages {
        page_ids: vec!["1".to_string()],
        options: WikiPageOptions::default(),
    };
    let err = spec.crawl(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("[wiki]"));
}

fn listed_page(page_id: &str, space_id: &str, key: &str) -> serde_json::Value {
    json!({
        "id": page_id,
        "title": format!("Listed {page_id}"),
        "spaceId": space_id,
        "body": { "storage": { "value": format!("<p>{page_id}</p>") } },
        "version": { "createdAt": "2024-04-01T00:00:00.000Z" },
        "_links": { "webui": format!("/spaces/{key}/pages/{page_id}/Listed") }
    })
}

async fn mount_space_listing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/spaces"))
        .and(query_param("type", "global"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "id": "900", "key": "ENG", "name": "Engineering" },
                { "id": "901", "key": "OPS", "name": "Operations" }
            ],
            "_links": {}
        })))
        .expect(1)
        .mount(server)
        .await;
}

/// Mounts a two-page listing for space 900 joined by `_links.next`.
async fn mount_engineering_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages"))
        .and(query_param("space-id", "900"))
        .and(query_param("limit", "250"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [listed_page("1", "900", "ENG")],
            "_links": { "next": "/wiki/api/v2/pages?space-id=900&cursor=page-2" }
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages"))
        .and(query_param("cursor", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [listed_page("2", "900", "ENG")],
            "_links": {}
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_spaces_target_follows_next_links_and_drops_unrequested_spaces() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    mount_space_listing(&server).await;
    mount_engineering_pages(&server).await;
    // OPS was not requested, so its pages are never listed.
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages"))
        .and(query_param("space-id", "901"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let ctx = context(&server, &temp_dir);
    let spec = TargetSpec::WikiSpaces {
        space_keys: vec!["ENG".to_string()],
        options: WikiOptions::default(),
    };
    let report = spec.crawl(&ctx).await.expect("crawl should succeed");
    assert_eq!(report.emitted, 2);
    assert_eq!(report.failed, 0);

    let records = ctx.output.read_metadata_records("docs").await.unwrap();
    let names: Vec<_> = records.iter().map(|r| r.file_name().to_string()).collect();
    assert_eq!(names, vec!["ENG 1.html", "ENG 2.html"]);
    for record in &records {
        assert_eq!(record.struct_data.extra["spaceName"], "Engineering");
    }
    assert_eq!(
        records[1].struct_data.web_url,
        format!("{}/wiki/spaces/ENG/pages/2", server.uri())
    );
}

#[tokio::test]
async fn test_all_target_crawls_every_space_and_counts_failed_listing() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    mount_space_listing(&server).await;
    mount_engineering_pages(&server).await;
    Mock::given(method("GET"))
        .and(path("/wiki/api/v2/pages"))
        .and(query_param("space-id", "901"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context(&server, &temp_dir);
    let spec = TargetSpec::WikiAll {
        options: WikiOptions::default(),
    };
    let report = spec.crawl(&ctx).await.expect("one readable space keeps the target alive");
    assert_eq!(report.emitted, 2);
    assert_eq!(report.failed, 1);

    let records = ctx.output.read_metadata_records("docs").await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.file_name().starts_with("ENG ")));
}
