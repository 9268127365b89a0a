//! Prompt construction and coder-CLI output parsing shared by every runner:
//! the six spec-phase prompt templates (§4.9), the loop/PRD iteration
//! prompts, and the JSON/summary extraction helpers the spec pipeline and
//! judge/improve loop both rely on.

use orc_core::types::SpecPhase;

// ---------------------------------------------------------------------------
// Phase prompt builder (§4.9)
// ---------------------------------------------------------------------------

/// Context available to a spec-phase prompt template. Fields are filled in
/// as prior phases complete; a phase's template only reads what it needs.
#[derive(Debug, Clone, Default)]
pub struct PhaseContext {
    pub feature_title: String,
    pub feature_description: Option<String>,
    pub is_cosmetic_feature: bool,
    pub client_name: String,
    pub repo_name: String,
    pub tech_stack: Option<String>,
    pub existing_constitution: Option<String>,
    pub existing_spec: Option<String>,
    pub existing_plan: Option<String>,
    pub clarification_responses: Vec<(String, String)>,
    pub relevant_memories: Option<String>,
}

/// Render the fixed template for `phase`, naming its phase number and
/// required output keys, injecting only the prior artifacts that phase uses.
pub fn build_phase_prompt(phase: SpecPhase, ctx: &PhaseContext) -> String {
    let header = format!(
        "Phase {}/6: {}\nClient: {}\nRepository: {}\nFeature: {}\n",
        SpecPhase::ORDER.iter().position(|p| *p == phase).unwrap() + 1,
        phase.label(),
        ctx.client_name,
        ctx.repo_name,
        ctx.feature_title,
    );

    let body = match phase {
        SpecPhase::Constitution => {
            let mut s = String::from(
                "Produce a project constitution.\nRequired output keys: constitution (markdown), techStack, keyPatterns[].\n",
            );
            if ctx.is_cosmetic_feature {
                s.push_str("This feature is cosmetic/UI-facing: add a UI-testing standards section and instruct inclusion of a headless-browser e2e test scaffold.\n");
            }
            s
        }
        SpecPhase::Specify => format!(
            "Write the feature specification.\nRequired output keys: spec {{overview, requirements[{{id,description,priority}}], acceptanceCriteria[{{id,requirement,criteria}}], outOfScope[], edgeCases[]}}.\n{}",
            ctx.existing_constitution
                .as_deref()
                .map(|c| format!("Constitution so far:\n{c}\n"))
                .unwrap_or_default()
        ),
        SpecPhase::Clarify => format!(
            "Identify open questions blocking planning.\nRequired output keys: clarifications[{{id, category, question, context, suggestedDefault?}}], assumptions[], risksIfUnclarified[].\n{}",
            ctx.existing_spec
                .as_deref()
                .map(|s| format!("Spec so far:\n{s}\n"))
                .unwrap_or_default()
        ),
        SpecPhase::Plan => {
            let mut s = String::from(
                "Produce an implementation plan.\nRequired output keys: plan {architecture, techDecisions[], fileStructure:{create[],modify[]}, schemaChanges[], apiChanges[], dependencies[]}.\n",
            );
            if !ctx.clarification_responses.is_empty() {
                s.push_str("Clarification responses:\n");
                for (q, a) in &ctx.clarification_responses {
                    s.push_str(&format!("- {q} -> {a}\n"));
                }
            }
            if let Some(memories) = &ctx.relevant_memories {
                s.push_str(&format!("Relevant memories:\n{memories}\n"));
            }
            s
        }
        SpecPhase::Analyze => format!(
            "Analyze the plan for feasibility and reuse opportunities.\nRequired output keys: analysis {{passed: bool, issues[{{severity,description,suggestion}}], existingPatterns[], reusableCode[], suggestions[]}}.\n{}",
            ctx.existing_plan
                .as_deref()
                .map(|p| format!("Plan so far:\n{p}\n"))
                .unwrap_or_default()
        ),
        SpecPhase::Tasks => String::from(
            "Break the plan into ordered implementation tasks.\nRequired output keys: tasks[{id:int, title, description, files[], tests?, dependencies:int[], estimatePoints?, acceptanceCriteria?}], criticalPath, parallelizable.\n",
        ),
    };

    format!("{header}\n{body}")
}

// ---------------------------------------------------------------------------
// Loop / PRD prompt builders (§4.6, §4.7)
// ---------------------------------------------------------------------------

/// Build the per-iteration prompt for the promise-token loop runner.
pub fn build_loop_iteration_prompt(
    iteration: i64,
    max_iterations: i64,
    promise_token: &str,
    previous_progress: &str,
    base_prompt: &str,
) -> String {
    format!(
        "Iteration {iteration}/{max_iterations}. Emit `{promise_token}` only once the work is fully complete.\n\n\
Previous progress:\n{previous_progress}\n\n\
Task:\n{base_prompt}\n\n\
Instructions: write a `## Summary` section describing what you did this iteration, append it to `.ralph-progress.md`, \
prioritize fixing any previously failed feedback before new work, and emit the completion token when and only when done."
    )
}

/// Build the per-iteration prompt for the PRD (story-by-story) runner.
pub fn build_prd_iteration_prompt(
    story_id: i64,
    story_title: &str,
    prd_title: &str,
    branch_name: &str,
) -> String {
    format!(
        "PRD: {prd_title}\nBranch: {branch_name}\nImplement ONLY story [{story_id}] \"{story_title}\".\n\n\
Do not implement any other story in this iteration.\n\
Instructions: implement the story, run the project's quality checks, update `prd.json` setting this story's \
`passes` to true, append progress notes to `progress.txt`, commit with message `feat: [{story_id}] {story_title}`, \
and emit `<promise>COMPLETE</promise>` only once every story in prd.json has `passes=true`."
    )
}

/// Build the per-iteration prompt for spec-task mode (§4.11): drives a
/// single eligible task to completion, signaled by `<task-complete>ID</task-complete>`.
pub fn build_spec_task_prompt(task_id: i64, title: &str, description: &str) -> String {
    format!(
        "Implement task [{task_id}] \"{title}\".\n\n{description}\n\n\
Emit `<task-complete>{task_id}</task-complete>` once this task, and only this task, is complete."
    )
}

/// Build the prompt for the PRD-Generation Runner: turns free-form feature
/// notes into a structured PRD document, not yet broken down by the CLI
/// into per-story implementation (that happens later, in the PRD Runner).
pub fn build_prd_generation_prompt(
    feature_title: &str,
    feature_description: Option<&str>,
    client_name: &str,
    client_context: Option<&str>,
) -> String {
    let mut s = format!(
        "Write a product requirements document for the feature \"{feature_title}\" for client {client_name}.\n\
Required output keys: title, description?, stories[{{id:int (1-indexed), title, description?, acceptanceCriteria?}}].\n\
Order stories so earlier ones unblock later ones; do not mark any story's `passes` field, it defaults to false.\n"
    );
    if let Some(desc) = feature_description {
        s.push_str(&format!("Feature notes:\n{desc}\n"));
    }
    if let Some(ctx) = client_context {
        s.push_str(&format!("Client context:\n{ctx}\n"));
    }
    s
}

// ---------------------------------------------------------------------------
// JSON extraction (§4.8 precedence, reused by §4.10)
// ---------------------------------------------------------------------------

/// Extract a JSON value from CLI output, trying in order: a fenced ```json
/// block, a plain fenced block, the first balanced `{...}`/`[...]`
/// substring, and finally the raw trimmed text.
pub fn extract_json(output: &str) -> Option<serde_json::Value> {
    if let Some(block) = extract_fenced(output, Some("json")) {
        if let Ok(v) = serde_json::from_str(&block) {
            return Some(v);
        }
    }
    if let Some(block) = extract_fenced(output, None) {
        if let Ok(v) = serde_json::from_str(&block) {
            return Some(v);
        }
    }
    if let Some(balanced) = extract_balanced(output) {
        if let Ok(v) = serde_json::from_str(&balanced) {
            return Some(v);
        }
    }
    serde_json::from_str(output.trim()).ok()
}

fn extract_fenced(text: &str, lang: Option<&str>) -> Option<String> {
    let fence = match lang {
        Some(l) => format!("```{l}"),
        None => "```".to_string(),
    };
    let start = text.find(&fence)? + fence.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn extract_balanced(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let (open, close) = match b {
            b'{' => (b'{', b'}'),
            b'[' => (b'[', b']'),
            _ => continue,
        };
        let mut depth = 0i32;
        for (j, &c) in bytes[i..].iter().enumerate() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Some(text[i..i + j + 1].to_string());
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Summary extraction (§4.6 step 5)
// ---------------------------------------------------------------------------

const SUMMARY_MAX_CHARS: usize = 2_000;
const FALLBACK_MAX_CHARS: usize = 1_000;
const FALLBACK_LINES: usize = 10;

/// Extract the `## Summary` section from iteration output (case-insensitive
/// heading match), stopping at the next heading / `---` / `**bold` line,
/// truncated to 2000 chars. Falls back to the last 10 non-empty output
/// lines, truncated to 1000 chars, if no summary heading is present.
pub fn extract_summary(output: &str) -> String {
    let lower = output.to_lowercase();
    if let Some(start) = lower.find("## summary") {
        let after_heading = &output[start + "## summary".len()..];
        let mut section = String::new();
        for line in after_heading.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#')
                || trimmed.starts_with("---")
                || trimmed.starts_with("**")
            {
                break;
            }
            section.push_str(line);
            section.push('\n');
        }
        let trimmed = section.trim();
        return trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
    }

    let tail: Vec<&str> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .rev()
        .take(FALLBACK_LINES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let joined = tail.join("\n");
    joined.chars().take(FALLBACK_MAX_CHARS).collect()
}
