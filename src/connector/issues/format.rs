//! Plain-text document bodies for issues and epic summaries.
//!
//! Section order in an issue body is fixed: fields, then test steps, then
//! comments. Optional sections are omitted entirely when empty.

use super::api::{Comment, Issue};
use super::test_steps::TestStep;

/// Field block: one `Label: value` entry per populated field, blank-line separated.
#[must_use]
pub fn issue_fields(issue: &Issue) -> String {
    let mut lines = vec![
        format!("Issue Key: {}", issue.key),
        format!("Issue Type: {}", issue.issue_type),
        format!("Title: {}", issue.summary),
        format!("Project Name: {}", issue.project_name),
    ];
    if !issue.labels.is_empty() {
        lines.push(format!("Labels: {}", issue.labels.join(", ")));
    }
    lines.push(format!("Created Time: {}", issue.created));
    lines.push(format!("Updated Time: {}", issue.updated));
    lines.extend(
        issue
            .custom_fields
            .iter()
            .map(|(name, value)| format!("{name}: {value}")),
    );
    if let Some(description) = &issue.description {
        lines.push(format!("Description: \n{description}"));
    }
    lines.join("\n\n")
}

/// Test step section, or an empty string when there are no steps.
#[must_use]
pub fn test_steps_section(steps: &[TestStep]) -> String {
    if steps.is_empty() {
        return String::new();
    }
    let body = steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut parts = vec![format!("Test Number: {}", index + 1)];
            if let Some(text) = non_empty(step.step.as_deref()) {
                parts.push(format!("Test Step: \n{text}"));
            }
            if let Some(text) = non_empty(step.data.as_deref()) {
                parts.push(format!("Test Data: \n{text}"));
            }
            if let Some(text) = non_empty(step.result.as_deref()) {
                parts.push(format!("Test Result: \n{text}"));
            }
            parts.join("\n\n")
        })
        .collect::<Vec<_>>()
        .join("\n===\n");
    format!("\n\nTest Scenarios:\n=====\n{body}\n=====\n")
}

/// Comment section, or an empty string when there are no comments.
#[must_use]
pub fn comments_section(comments: &[Comment]) -> String {
    if comments.is_empty() {
        return String::new();
    }
    let body = comments
        .iter()
        .enumerate()
        .map(|(index, comment)| {
            [
                format!("Comment Number: {}", index + 1),
                format!("Comment Author: {}", comment.author),
                format!("Comment Updated Time: {}", comment.updated),
                format!("Comment Body: \n{}", comment.body),
            ]
            .join("\n\n")
        })
        .collect::<Vec<_>>()
        .join("\n=====\n");
    format!("\n\nComments:\n=====\n{body}\n=====\n")
}

/// Full issue body: fields, then test steps, then comments.
#[must_use]
pub fn issue_body(issue: &Issue, steps: &[TestStep], comments: &[Comment]) -> String {
    let mut body = issue_fields(issue);
    body.push_str(&test_steps_section(steps));
    body.push_str(&comments_section(comments));
    body
}

/// Epic summary: header followed by one line per story.
#[must_use]
pub fn epic_summary(epic: &Issue, stories: &[Issue]) -> String {
    let mut body = format!(
        "Epic ID: {}\nEpic Title: {}\n=====\nListing of User Stories:\n\n",
        epic.key, epic.summary
    );
    for story in stories {
        body.push_str(&format!(
            "{}: {} [Last Updated On: {}]\n",
            story.key, story.summary, story.updated
        ));
    }
    body
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(key: &str, summary: &str) -> Issue {
        Issue {
            id: "1".to_string(),
            key: key.to_string(),
            issue_type: "Story".to_string(),
            summary: summary.to_string(),
            project_name: "Shop".to_string(),
            project_id: "200".to_string(),
            labels: Vec::new(),
            created: "2024-01-01".to_string(),
            updated: "2024-02-01".to_string(),
            description: None,
            custom_fields: Vec::new(),
        }
    }

    // ==================== Field Block Tests ====================

    #[test]
    fn test_issue_fields_omits_empty_labels_and_description() {
        let text = issue_fields(&issue("SLS-1", "Login"));
        assert_eq!(
            text,
            "Issue Key: SLS-1\n\nIssue Type: Story\n\nTitle: Login\n\nProject Name: Shop\n\n\
             Created Time: 2024-01-01\n\nUpdated Time: 2024-02-01"
        );
    }

    #[test]
    fn test_issue_fields_with_labels_custom_fields_and_description() {
        let mut i = issue("SLS-1", "Login");
        i.labels = vec!["web".to_string(), "auth".to_string()];
        i.custom_fields = vec![("Story Points".to_string(), "3".to_string())];
        i.description = Some("<p>Build it</p>".to_string());

        let text = issue_fields(&i);
        assert!(text.contains("Project Name: Shop\n\nLabels: web, auth\n\nCreated Time"));
        assert!(text.contains("Updated Time: 2024-02-01\n\nStory Points: 3"));
        assert!(text.ends_with("Description: \n<p>Build it</p>"));
    }

    // ==================== Section Tests ====================

    #[test]
    fn test_sections_are_empty_without_items() {
        assert!(test_steps_section(&[]).is_empty());
        assert!(comments_section(&[]).is_empty());
    }

    #[test]
    fn test_test_steps_section_skips_missing_parts() {
        let steps = vec![
            TestStep {
                order_id: 1,
                step: Some("Open page".to_string()),
                data: None,
                result: Some("Page shown".to_string()),
            },
            TestStep {
                order_id: 2,
                step: Some("Click".to_string()),
                data: Some(String::new()),
                result: None,
            },
        ];
        let text = test_steps_section(&steps);
        assert_eq!(
            text,
            "\n\nTest Scenarios:\n=====\nTest Number: 1\n\nTest Step: \nOpen page\n\n\
             Test Result: \nPage shown\n===\nTest Number: 2\n\nTest Step: \nClick\n=====\n"
        );
    }

    #[test]
    fn test_issue_body_orders_steps_before_comments() {
        let steps = vec![TestStep {
            order_id: 1,
            step: Some("Go".to_string()),
            data: None,
            result: None,
        }];
        let comments = vec![Comment {
            author: "Ana".to_string(),
            body: "<p>ok</p>".to_string(),
            created: "c".to_string(),
            updated: "u".to_string(),
        }];
        let body = issue_body(&issue("SLS-1", "Login"), &steps, &comments);
        let steps_at = body.find("Test Scenarios:").unwrap_or(usize::MAX);
        let comments_at = body.find("Comments:").unwrap_or(0);
        assert!(steps_at < comments_at);
        assert!(body.contains("Comment Number: 1\n\nComment Author: Ana\n\nComment Updated Time: u"));
        assert!(body.ends_with("Comment Body: \n<p>ok</p>\n=====\n"));
    }

    // ==================== Epic Summary Tests ====================

    #[test]
    fn test_epic_summary_lists_stories() {
        let epic = issue("SLS-10", "Checkout");
        let stories = vec![issue("SLS-11", "Cart"), issue("SLS-12", "Pay")];
        assert_eq!(
            epic_summary(&epic, &stories),
            "Epic ID: SLS-10\nEpic Title: Checkout\n=====\nListing of User Stories:\n\n\
             SLS-11: Cart [Last Updated On: 2024-02-01]\n\
             SLS-12: Pay [Last Updated On: 2024-02-01]\n"
        );
    }
}
