//! Issue ordering from declared dependencies.

use crate::github::Issue;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::LazyLock;

static DEPENDS_ON_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(?:depends\s+on|blocked\s+by)\s*:?\s*([^\n]*)")
        .expect("depends-on regex is valid")
});

static ISSUE_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\d+)").expect("issue ref regex is valid"));

static DEPENDS_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^depends[-_ ]on[-_:# ]*(\d+)$").expect("depends label regex is valid")
});

/// Issue numbers this issue declares it depends on, in first-seen order.
///
/// Sources: `depends on #N` / `blocked by #N` in the body (several refs on
/// one line are all taken) and labels such as `depends-on-N`.
pub fn parse_dependencies(issue: &Issue) -> Vec<u64> {
    let mut deps = Vec::new();
    let mut push = |n: u64| {
        if n != issue.number && !deps.contains(&n) {
            deps.push(n);
        }
    };
    for line in DEPENDS_ON_REGEX.captures_iter(&issue.body) {
        let Some(rest) = line.get(1) else { continue };
        for r in ISSUE_REF_REGEX.captures_iter(rest.as_str()) {
            if let Some(n) = r.get(1).and_then(|m| m.as_str().parse().ok()) {
                push(n);
            }
        }
    }
    for label in &issue.labels {
        if let Some(n) = DEPENDS_LABEL_REGEX
            .captures(label.trim())
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            push(n);
        }
    }
    deps
}

/// Order issues so each comes after the issues it depends on.
///
/// References to issues outside the list are ignored. Among issues that are
/// ready at the same time the original order wins. Issues caught in a cycle
/// (or waiting on one) keep their original relative order and go last.
pub fn sort_by_dependencies(issues: Vec<Issue>) -> Vec<Issue> {
    if issues.len() < 2 {
        return issues;
    }

    let mut index_map: HashMap<u64, usize> = HashMap::new();
    for (i, issue) in issues.iter().enumerate() {
        index_map.entry(issue.number).or_insert(i);
    }

    let mut forward_edges: Vec<Vec<usize>> = vec![Vec::new(); issues.len()];
    let mut in_degree: Vec<usize> = vec![0; issues.len()];
    for (to_idx, issue) in issues.iter().enumerate() {
        for dep in parse_dependencies(issue) {
            let Some(&from_idx) = index_map.get(&dep) else {
                tracing::debug!(issue = issue.number, dep, "dependency not in this run, ignored");
                continue;
            };
            if from_idx == to_idx {
                continue;
            }
            forward_edges[from_idx].push(to_idx);
            in_degree[to_idx] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(issues.len());
    let mut placed = vec![false; issues.len()];
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        placed[node] = true;
        for &dependent in &forward_edges[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != issues.len() {
        let stuck: Vec<u64> = (0..issues.len())
            .filter(|&i| !placed[i])
            .map(|i| issues[i].number)
            .collect();
        println!(
            "  {} dependency cycle among issues {:?}, keeping their original order",
            console::style("!").yellow(),
            stuck
        );
        tracing::warn!(?stuck, "dependency cycle detected");
        order.extend((0..issues.len()).filter(|&i| !placed[i]));
    }

    let mut slots: Vec<Option<Issue>> = issues.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(number: u64, body: &str, labels: &[&str]) -> Issue {
        Issue {
            number,
            title: format!("Issue {number}"),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            body: body.to_string(),
        }
    }

    fn numbers(issues: &[Issue]) -> Vec<u64> {
        issues.iter().map(|i| i.number).collect()
    }

    #[test]
    fn test_parse_body_and_labels() {
        let i = issue(
            5,
            "Some text.\nDepends on #3 and #4\nblocked by: #2\nmentions #9",
            &["depends-on-1", "bug"],
        );
        assert_eq!(parse_dependencies(&i), vec![3, 4, 2, 1]);
    }

    #[test]
    fn test_parse_ignores_self_and_duplicates() {
        let i = issue(5, "depends on #5\ndepends on #3\nDEPENDS ON #3", &["depends-on-3"]);
        assert_eq!(parse_dependencies(&i), vec![3]);
    }

    #[test]
    fn test_sort_moves_dependency_first() {
        let issues = vec![issue(2, "depends on #1", &[]), issue(1, "", &[])];
        assert_eq!(numbers(&sort_by_dependencies(issues)), vec![1, 2]);
    }

    #[test]
    fn test_sort_is_stable_for_independent_issues() {
        let issues = vec![issue(30, "", &[]), issue(10, "", &[]), issue(20, "", &[])];
        assert_eq!(numbers(&sort_by_dependencies(issues)), vec![30, 10, 20]);
    }

    #[test]
    fn test_sort_diamond() {
        let issues = vec![
            issue(4, "depends on #2, #3", &[]),
            issue(3, "depends on #1", &[]),
            issue(2, "depends on #1", &[]),
            issue(1, "", &[]),
        ];
        assert_eq!(numbers(&sort_by_dependencies(issues)), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_unresolved_reference_is_ignored() {
        let issues = vec![issue(2, "depends on #99", &[]), issue(1, "", &[])];
        assert_eq!(numbers(&sort_by_dependencies(issues)), vec![2, 1]);
    }

    #[test]
    fn test_cycle_keeps_original_order() {
        let issues = vec![
            issue(5, "", &[]),
            issue(2, "depends on #3", &[]),
            issue(3, "depends on #2", &[]),
            issue(4, "depends on #2", &[]),
        ];
        // 5 is free; 2, 3 and 4 are stuck behind the cycle, original order kept.
        assert_eq!(numbers(&sort_by_dependencies(issues)), vec![5, 2, 3, 4]);
    }

    #[test]
    fn test_result_is_topological() {
        let issues = vec![
            issue(1, "depends on #3", &[]),
            issue(2, "", &["depends-on-1"]),
            issue(3, "", &[]),
        ];
        let sorted = numbers(&sort_by_dependencies(issues));
        let pos = |n| sorted.iter().position(|&x| x == n).unwrap();
        assert!(pos(3) < pos(1));
        assert!(pos(1) < pos(2));
    }
}
