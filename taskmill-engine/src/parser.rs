/// Task-graph parser: markdown document → typed task graph
///
/// The parser is a pure function over the input text; it never touches
/// the store. The expected document shape:
///
/// ```text
/// # Task 025: Ship the importer
///
/// **Objective**: One paragraph describing the goal.
///
/// ## Requirements
///
/// - [ ] First requirement
/// - [ ] Second requirement
///
/// ### Task 1: Build the schema
///
/// - **Execution mode**: sequential
/// - **Priority**: high
/// - Create the table definitions
///   - Include the audit columns
///
/// ### Task 2: Wire the importer
///
/// - **Dependencies**: Task 1
/// - **Timeout**: 120000
/// - Connect the reader to the schema
/// ```
///
/// Missing title, objective or requirements fail with `malformed-input`;
/// a dependency that does not resolve to a sibling ordinal fails with
/// `ambiguous-dependency`. [`format_task_markdown`] renders the canonical
/// form of a parsed graph, and `parse ∘ format ∘ parse = parse` holds for
/// well-formed input.

use serde::{Deserialize, Serialize};
use taskmill_shared::error::{TaskmillError, TaskmillResult};
use taskmill_shared::models::task::{ExecutionMode, Priority};

/// Root node of a parsed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRoot {
    /// Id from the title line (`# Task <id>: <name>`)
    pub id: String,

    /// Human name from the title line
    pub name: String,

    /// Objective paragraph; becomes the root description
    pub objective: String,

    /// Requirements list; becomes `metadata.requirements`
    pub requirements: Vec<String>,

    /// Root-level dispatch mode (defaults to sequential)
    pub execution_mode: ExecutionMode,

    /// Root-level default timeout override in milliseconds
    pub timeout_ms: Option<i64>,
}

/// One `### Task N:` child of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSubTask {
    /// 1-based declaration ordinal (the `N` of the heading)
    pub ordinal: i64,

    /// Generated id: `<root-id>-sub-<N>`
    pub id: String,

    /// Sub-task name from the heading
    pub name: String,

    /// Per-node dispatch mode override
    pub execution_mode: Option<ExecutionMode>,

    /// Ids of siblings that must be terminal-success first
    pub dependencies: Vec<String>,

    /// Advisory priority
    pub priority: Option<Priority>,

    /// Free-form complexity annotation
    pub complexity: Option<String>,

    /// Free-form impact annotation
    pub impact: Option<String>,

    /// Per-node timeout override in milliseconds
    pub timeout_ms: Option<i64>,

    /// Implementation-step bullets, nesting preserved verbatim
    pub steps: Vec<String>,
}

impl ParsedSubTask {
    /// The prompt submitted to the assistant CLI: name plus the step
    /// bullets with their nesting intact.
    pub fn prompt(&self) -> String {
        let mut prompt = self.name.clone();
        if !self.steps.is_empty() {
            prompt.push('\n');
            for step in &self.steps {
                prompt.push('\n');
                prompt.push_str(step);
            }
        }
        prompt
    }
}

/// A parsed document: one root, its children in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedGraph {
    pub root: ParsedRoot,
    pub subtasks: Vec<ParsedSubTask>,
}

fn malformed(msg: impl Into<String>) -> TaskmillError {
    TaskmillError::MalformedInput(msg.into())
}

/// Strips a `- **Label**: value` bullet, returning `(label, value)` when
/// the line is a labelled field.
fn labelled_field(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("- **")?;
    let (label, value) = rest.split_once("**:")?;
    Some((label.trim().to_lowercase(), value.trim().to_string()))
}

/// Strips a `**Label**: value` preamble line.
fn preamble_field(line: &str) -> Option<(String, String)> {
    let rest = line.trim().strip_prefix("**")?;
    let (label, value) = rest.split_once("**:")?;
    Some((label.trim().to_lowercase(), value.trim().to_string()))
}

fn parse_timeout(value: &str) -> TaskmillResult<i64> {
    let digits = value.trim().trim_end_matches("ms").trim();
    let timeout: i64 = digits
        .parse()
        .map_err(|_| malformed(format!("unparseable timeout '{}'", value)))?;
    if timeout <= 0 {
        return Err(TaskmillError::InvalidInput(format!(
            "timeout must be positive, got {}",
            timeout
        )));
    }
    Ok(timeout)
}

fn parse_mode(value: &str) -> TaskmillResult<ExecutionMode> {
    ExecutionMode::parse(&value.to_lowercase())
        .ok_or_else(|| malformed(format!("unknown execution mode '{}'", value)))
}

/// Resolves a `Dependencies` value ("Task 1, Task 3" or "None") into
/// sibling ordinals.
fn parse_dependency_ordinals(value: &str) -> TaskmillResult<Vec<i64>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }

    let mut ordinals = Vec::new();
    for part in trimmed.split(',') {
        let name = part.trim();
        let digits = name
            .strip_prefix("Task ")
            .or_else(|| name.strip_prefix("task "))
            .unwrap_or(name);
        let ordinal: i64 = digits.trim().parse().map_err(|_| {
            TaskmillError::AmbiguousDependency(format!(
                "'{}' does not name a sibling task",
                name
            ))
        })?;
        ordinals.push(ordinal);
    }
    Ok(ordinals)
}

/// Parses a task markdown document into a typed graph
///
/// # Errors
///
/// `malformed-input` when the title, objective or requirements section is
/// missing; `ambiguous-dependency` when a named dependency does not
/// resolve to a sibling; `invalid-input` for a non-positive timeout.
pub fn parse_task_markdown(input: &str) -> TaskmillResult<ParsedGraph> {
    let lines: Vec<&str> = input.lines().collect();

    // Title line: `# Task <id>: <name>`
    let title_line = lines
        .iter()
        .find(|l| l.starts_with("# "))
        .ok_or_else(|| malformed("missing title line (`# Task <id>: <name>`)"))?;
    let title_rest = title_line
        .trim_start_matches('#')
        .trim()
        .strip_prefix("Task ")
        .ok_or_else(|| malformed("title line must start with `# Task`"))?;
    let (root_id, root_name) = title_rest
        .split_once(':')
        .ok_or_else(|| malformed("title line must be `# Task <id>: <name>`"))?;
    let root_id = root_id.trim().to_string();
    let root_name = root_name.trim().to_string();
    if root_id.is_empty() || root_name.is_empty() {
        return Err(malformed("title line must carry both an id and a name"));
    }

    // Preamble: objective paragraph plus optional root-level fields.
    let mut objective: Option<String> = None;
    let mut root_mode = ExecutionMode::Sequential;
    let mut root_timeout: Option<i64> = None;

    let first_subtask = lines
        .iter()
        .position(|l| l.starts_with("### "))
        .unwrap_or(lines.len());

    let mut i = 0;
    while i < first_subtask {
        let line = lines[i];
        if let Some((label, value)) = preamble_field(line) {
            match label.as_str() {
                "objective" => {
                    // The objective paragraph may wrap onto following lines.
                    let mut paragraph = value;
                    let mut j = i + 1;
                    while j < first_subtask
                        && !lines[j].trim().is_empty()
                        && !lines[j].starts_with('#')
                        && preamble_field(lines[j]).is_none()
                    {
                        paragraph.push(' ');
                        paragraph.push_str(lines[j].trim());
                        j += 1;
                    }
                    objective = Some(paragraph);
                    i = j;
                    continue;
                }
                "execution mode" => root_mode = parse_mode(&value)?,
                "timeout" => root_timeout = Some(parse_timeout(&value)?),
                _ => {}
            }
        }
        i += 1;
    }

    let objective =
        objective.ok_or_else(|| malformed("missing objective (`**Objective**: ...`)"))?;
    if objective.is_empty() {
        return Err(malformed("objective paragraph is empty"));
    }

    // Requirements section.
    let requirements_heading = lines[..first_subtask]
        .iter()
        .position(|l| l.trim().eq_ignore_ascii_case("## requirements"))
        .ok_or_else(|| malformed("missing `## Requirements` section"))?;

    let mut requirements = Vec::new();
    for line in &lines[requirements_heading + 1..first_subtask] {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            break;
        }
        if let Some(item) = trimmed.strip_prefix("- ") {
            let item = item
                .strip_prefix("[ ] ")
                .or_else(|| item.strip_prefix("[x] "))
                .unwrap_or(item);
            requirements.push(item.trim().to_string());
        }
    }
    if requirements.is_empty() {
        return Err(malformed("requirements section has no items"));
    }

    // Sub-task blocks.
    let mut subtasks: Vec<ParsedSubTask> = Vec::new();
    let mut pending_deps: Vec<(usize, Vec<i64>)> = Vec::new();

    let mut i = first_subtask;
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("### ") {
            i += 1;
            continue;
        }

        let heading = line.trim_start_matches('#').trim();
        let rest = heading
            .strip_prefix("Task ")
            .ok_or_else(|| malformed(format!("bad sub-task heading '{}'", line)))?;
        let (ordinal_str, name) = rest
            .split_once(':')
            .ok_or_else(|| malformed(format!("bad sub-task heading '{}'", line)))?;
        let ordinal: i64 = ordinal_str
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad sub-task ordinal '{}'", ordinal_str)))?;
        if subtasks.iter().any(|s| s.ordinal == ordinal) {
            return Err(malformed(format!("duplicate sub-task ordinal {}", ordinal)));
        }

        let mut subtask = ParsedSubTask {
            ordinal,
            id: format!("{}-sub-{}", root_id, ordinal),
            name: name.trim().to_string(),
            execution_mode: None,
            dependencies: Vec::new(),
            priority: None,
            complexity: None,
            impact: None,
            timeout_ms: None,
            steps: Vec::new(),
        };
        let mut dep_ordinals = Vec::new();

        i += 1;
        while i < lines.len() && !lines[i].starts_with("### ") {
            let body_line = lines[i];
            if let Some((label, value)) = labelled_field(body_line) {
                match label.as_str() {
                    "execution mode" => subtask.execution_mode = Some(parse_mode(&value)?),
                    "dependencies" => dep_ordinals = parse_dependency_ordinals(&value)?,
                    "priority" => {
                        subtask.priority = Some(Priority::parse(&value.to_lowercase()).ok_or_else(
                            || malformed(format!("unknown priority '{}'", value)),
                        )?)
                    }
                    "complexity" => subtask.complexity = Some(value),
                    "impact" => subtask.impact = Some(value),
                    "timeout" => subtask.timeout_ms = Some(parse_timeout(&value)?),
                    _ => {}
                }
            } else if body_line.trim_start().starts_with("- ") {
                // An implementation step; keep indentation so nested
                // bullets survive into the prompt.
                subtask.steps.push(body_line.trim_end().to_string());
            }
            i += 1;
        }

        pending_deps.push((subtasks.len(), dep_ordinals));
        subtasks.push(subtask);
    }

    // Resolve dependency ordinals to sibling ids now that all siblings
    // are known.
    for (index, ordinals) in pending_deps {
        let own_ordinal = subtasks[index].ordinal;
        let mut ids = Vec::new();
        for ordinal in ordinals {
            if ordinal == own_ordinal {
                return Err(TaskmillError::AmbiguousDependency(format!(
                    "Task {} depends on itself",
                    ordinal
                )));
            }
            let sibling = subtasks.iter().find(|s| s.ordinal == ordinal).ok_or_else(|| {
                TaskmillError::AmbiguousDependency(format!(
                    "Task {} names dependency 'Task {}' which is not a sibling",
                    own_ordinal, ordinal
                ))
            })?;
            ids.push(sibling.id.clone());
        }
        subtasks[index].dependencies = ids;
    }

    Ok(ParsedGraph {
        root: ParsedRoot {
            id: root_id,
            name: root_name,
            objective,
            requirements,
            execution_mode: root_mode,
            timeout_ms: root_timeout,
        },
        subtasks,
    })
}

/// Renders the canonical markdown form of a parsed graph.
pub fn format_task_markdown(graph: &ParsedGraph) -> String {
    let mut out = String::new();
    let root = &graph.root;

    out.push_str(&format!("# Task {}: {}\n\n", root.id, root.name));
    out.push_str(&format!("**Objective**: {}\n\n", root.objective));
    if root.execution_mode == ExecutionMode::Parallel {
        out.push_str("**Execution mode**: parallel\n\n");
    }
    if let Some(timeout) = root.timeout_ms {
        out.push_str(&format!("**Timeout**: {}\n\n", timeout));
    }

    out.push_str("## Requirements\n\n");
    for req in &root.requirements {
        out.push_str(&format!("- [ ] {}\n", req));
    }

    for subtask in &graph.subtasks {
        out.push_str(&format!("\n### Task {}: {}\n\n", subtask.ordinal, subtask.name));

        if let Some(mode) = subtask.execution_mode {
            out.push_str(&format!("- **Execution mode**: {}\n", mode.as_str()));
        }
        if !subtask.dependencies.is_empty() {
            let named: Vec<String> = subtask
                .dependencies
                .iter()
                .filter_map(|id| id.rsplit("-sub-").next())
                .map(|ordinal| format!("Task {}", ordinal))
                .collect();
            out.push_str(&format!("- **Dependencies**: {}\n", named.join(", ")));
        }
        if let Some(priority) = subtask.priority {
            out.push_str(&format!("- **Priority**: {}\n", priority.as_str()));
        }
        if let Some(complexity) = &subtask.complexity {
            out.push_str(&format!("- **Complexity**: {}\n", complexity));
        }
        if let Some(impact) = &subtask.impact {
            out.push_str(&format!("- **Impact**: {}\n", impact));
        }
        if let Some(timeout) = subtask.timeout_ms {
            out.push_str(&format!("- **Timeout**: {}\n", timeout));
        }
        for step in &subtask.steps {
            out.push_str(step);
            out.push('\n');
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"# Task 025: Ship the importer

**Objective**: Build and ship the CSV importer end to end.

## Requirements

- [ ] Importer reads the legacy format
- [ ] Errors are surfaced per row

### Task 1: Build the schema

- **Execution mode**: sequential
- **Priority**: high
- Create the table definitions
  - Include the audit columns

### Task 2: Wire the importer

- **Dependencies**: Task 1
- **Timeout**: 120000
- Connect the reader to the schema
"#;

    #[test]
    fn test_parse_well_formed_document() {
        let graph = parse_task_markdown(DOC).unwrap();

        assert_eq!(graph.root.id, "025");
        assert_eq!(graph.root.name, "Ship the importer");
        assert_eq!(
            graph.root.objective,
            "Build and ship the CSV importer end to end."
        );
        assert_eq!(graph.root.requirements.len(), 2);
        assert_eq!(graph.subtasks.len(), 2);

        let first = &graph.subtasks[0];
        assert_eq!(first.id, "025-sub-1");
        assert_eq!(first.execution_mode, Some(ExecutionMode::Sequential));
        assert_eq!(first.priority, Some(Priority::High));
        assert_eq!(first.steps.len(), 2);
        assert!(first.steps[1].starts_with("  - "), "nesting preserved");

        let second = &graph.subtasks[1];
        assert_eq!(second.dependencies, vec!["025-sub-1".to_string()]);
        assert_eq!(second.timeout_ms, Some(120_000));
    }

    #[test]
    fn test_prompt_preserves_nested_bullets() {
        let graph = parse_task_markdown(DOC).unwrap();
        let prompt = graph.subtasks[0].prompt();
        assert!(prompt.starts_with("Build the schema"));
        assert!(prompt.contains("- Create the table definitions"));
        assert!(prompt.contains("  - Include the audit columns"));
    }

    #[test]
    fn test_missing_title_is_malformed() {
        let err = parse_task_markdown("**Objective**: x\n## Requirements\n- y\n").unwrap_err();
        assert!(matches!(err, TaskmillError::MalformedInput(_)));
    }

    #[test]
    fn test_missing_objective_is_malformed() {
        let doc = "# Task 1: t\n\n## Requirements\n\n- [ ] r\n";
        let err = parse_task_markdown(doc).unwrap_err();
        assert!(matches!(err, TaskmillError::MalformedInput(_)));
    }

    #[test]
    fn test_missing_requirements_is_malformed() {
        let doc = "# Task 1: t\n\n**Objective**: o\n";
        let err = parse_task_markdown(doc).unwrap_err();
        assert!(matches!(err, TaskmillError::MalformedInput(_)));
    }

    #[test]
    fn test_unresolvable_dependency_is_ambiguous() {
        let doc = r#"# Task 9: t

**Objective**: o

## Requirements

- [ ] r

### Task 1: a

- **Dependencies**: Task 7
- do it
"#;
        let err = parse_task_markdown(doc).unwrap_err();
        assert!(matches!(err, TaskmillError::AmbiguousDependency(_)));
    }

    #[test]
    fn test_self_dependency_is_ambiguous() {
        let doc = r#"# Task 9: t

**Objective**: o

## Requirements

- [ ] r

### Task 1: a

- **Dependencies**: Task 1
- do it
"#;
        let err = parse_task_markdown(doc).unwrap_err();
        assert!(matches!(err, TaskmillError::AmbiguousDependency(_)));
    }

    #[test]
    fn test_zero_timeout_is_invalid_input() {
        let doc = r#"# Task 9: t

**Objective**: o

## Requirements

- [ ] r

### Task 1: a

- **Timeout**: 0
- do it
"#;
        let err = parse_task_markdown(doc).unwrap_err();
        assert!(matches!(err, TaskmillError::InvalidInput(_)));
        assert_eq!(err.code(), "invalid-input");
    }

    #[test]
    fn test_dependencies_none_is_empty() {
        let doc = r#"# Task 9: t

**Objective**: o

## Requirements

- [ ] r

### Task 1: a

- **Dependencies**: None
- do it
"#;
        let graph = parse_task_markdown(doc).unwrap();
        assert!(graph.subtasks[0].dependencies.is_empty());
    }

    #[test]
    fn test_format_parse_round_trip() {
        let parsed = parse_task_markdown(DOC).unwrap();
        let formatted = format_task_markdown(&parsed);
        let reparsed = parse_task_markdown(&formatted).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_root_level_parallel_mode() {
        let doc = r#"# Task 9: t

**Objective**: o

**Execution mode**: parallel

## Requirements

- [ ] r

### Task 1: a

- do it
"#;
        let graph = parse_task_markdown(doc).unwrap();
        assert_eq!(graph.root.execution_mode, ExecutionMode::Parallel);

        let formatted = format_task_markdown(&graph);
        let reparsed = parse_task_markdown(&formatted).unwrap();
        assert_eq!(graph, reparsed);
    }
}
