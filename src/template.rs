use crate::error::{PipelineError, Result};

/// A built-in analysis task. The section list is the contract for the
/// model's reply; instruction rendering derives from it so the prompt and
/// the expected output structure cannot drift apart.
#[derive(Debug, Clone)]
pub struct AnalysisTemplate {
    pub name: &'static str,
    pub system: &'static str,
    pub instructions: &'static str,
    pub sections: &'static [&'static str],
    /// Transcript data precedes instructions in the composed prompt.
    /// All built-ins are data-first; the composer rejects anything else.
    pub data_first: bool,
}

impl AnalysisTemplate {
    /// Instruction block appended after the transcript, ending with the
    /// mandated section headings.
    pub fn render_instructions(&self) -> String {
        let mut out = String::from(self.instructions.trim());
        out.push_str("\n\nStructure your reply as markdown with exactly these sections, in this order:\n");
        for section in self.sections {
            out.push_str(&format!("\n## {section}"));
        }
        out
    }
}

pub static STATE: AnalysisTemplate = AnalysisTemplate {
    name: "state",
    system: "You are a careful analyst of working sessions between a software engineer \
             and a coding assistant. You report only what the transcript supports, you \
             quote identifiers and paths exactly as they appear, and you never invent \
             detail to fill a gap.",
    instructions: "The transcript above is a working session that may have ended mid-task. \
Write a state summary that lets a fresh assistant instance pick the work up without \
re-reading the transcript. Be concrete: name files, commands, branches, and error \
messages exactly as they appear. Where the transcript leaves something undecided, say \
so instead of guessing. If a section has nothing to report, write \"None.\"",
    sections: &[
        "Current Task",
        "Completed Work",
        "Decisions",
        "Open Questions",
        "Files Touched",
        "Next Actions",
    ],
    data_first: true,
};

pub static INSIGHTS: AnalysisTemplate = AnalysisTemplate {
    name: "insights",
    system: "You are a retrospective reviewer of working sessions between a software \
             engineer (the operator) and a coding assistant. You extract honest, \
             specific lessons. Praise and criticism alike must cite evidence from the \
             transcript; generic observations are worthless.",
    instructions: r#"The transcript above is a completed working session. Review it end to end and report what actually helped and what actually hurt, on both sides of the collaboration.

For the Signal Entries section, write one fenced code block per entry, each formatted as:

```
id: <short-slug>
polarity: positive|negative
dimension: <behavior dimension, e.g. planning, verification, communication>
response-type: <kind of assistant response the entry concerns>
context: <one line on what was happening>
excerpt: <short verbatim quote from the transcript>
rationale: <why this moment is useful signal>
better: <negative entries only: the response that should have happened>
```

Include at most ten entries and prefer moments with a clear excerpt. If the transcript offers no usable signal, leave the section empty rather than padding it."#,
    sections: &[
        "Failures",
        "Successes",
        "Operator Friction Points",
        "Operator Strengths",
        "Collaboration Friction",
        "Collaboration Flow",
        "Lessons",
        "Signal Entries",
    ],
    data_first: true,
};

pub fn find(name: &str) -> Result<&'static AnalysisTemplate> {
    match name {
        "state" => Ok(&STATE),
        "insights" => Ok(&INSIGHTS),
        other => Err(PipelineError::TemplateNotFound(other.to_string())),
    }
}

pub fn names() -> &'static [&'static str] {
    &["state", "insights"]
}
