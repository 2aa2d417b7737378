use regex::Regex;
use std::sync::LazyLock;

// Line starts that usually mean the model emitted code outside a fence.
// This is a best-effort heuristic over free text: it will occasionally wrap
// prose that happens to start with a keyword, and it will miss languages not
// listed here. Both outcomes are tolerated; it only affects display.
static CODE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(\s{4,}\S|\s*(?:if|for|while|def|class|match|case|try|except|return|print|log\(|question\s*=|openssl|chmod|throttle_requests|import|from|const|let|var|function|async|await|sudo|npm|pip)\b)",
    )
    .expect("code line regex is valid")
});

static EXCESS_BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line regex is valid"));

static TRAILING_SPACES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +\n").expect("trailing space regex is valid"));

/// Wraps runs of loose code-looking lines in ```text fences, leaving
/// existing fenced blocks untouched.
fn wrap_loose_code_snippets(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut result: Vec<&str> = Vec::with_capacity(lines.len() + 4);
    let mut in_generated_fence = false;
    let mut inside_existing_fence = false;

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            if in_generated_fence {
                result.push("```");
                in_generated_fence = false;
            }
            inside_existing_fence = !inside_existing_fence;
            result.push(line);
            continue;
        }

        if inside_existing_fence {
            result.push(line);
            continue;
        }

        let is_code_line = CODE_LINE_RE.is_match(line);

        if is_code_line && !in_generated_fence {
            in_generated_fence = true;
            result.push("```text");
        } else if !is_code_line && in_generated_fence && !trimmed.is_empty() {
            result.push("```");
            in_generated_fence = false;
        }

        result.push(line);

        if index == lines.len() - 1 && in_generated_fence {
            result.push("```");
            in_generated_fence = false;
        }
    }

    result.join("\n")
}

/// Post-processes raw model output before it is stored as a message:
/// newline normalization, loose-code fencing, and whitespace tightening.
pub fn format_assistant_response(response: &str) -> String {
    let normalized = response.replace("\r\n", "\n");
    let normalized = normalized.trim();
    if normalized.is_empty() {
        return String::new();
    }

    let with_code_blocks = wrap_loose_code_snippets(normalized);
    // Remove excessive blank lines (3+ newlines -> 2 newlines max)
    let tightened = EXCESS_BLANK_LINES_RE.replace_all(&with_code_blocks, "\n\n");
    TRAILING_SPACES_RE.replace_all(&tightened, "\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_loose_shell_lines_in_text_fence() {
        let raw = "Run this first:\nsudo apt update\nsudo apt upgrade\nThen reboot.";
        let out = format_assistant_response(raw);
        assert_eq!(
            out,
            "Run this first:\n```text\nsudo apt update\nsudo apt upgrade\n```\nThen reboot."
        );
    }

    #[test]
    fn closes_generated_fence_at_end_of_text() {
        let out = format_assistant_response("Check the config:\nchmod 600 id_rsa");
        assert!(out.ends_with("chmod 600 id_rsa\n```"));
    }

    #[test]
    fn leaves_existing_fences_untouched() {
        let raw = "Example:\n```python\nimport os\nprint(os.name)\n```\nDone.";
        let out = format_assistant_response(raw);
        assert_eq!(out, raw);
    }

    #[test]
    fn keyword_inside_existing_fence_does_not_nest() {
        let raw = "```bash\nsudo systemctl restart nginx\n```";
        let out = format_assistant_response(raw);
        assert!(!out.contains("```text"));
    }

    #[test]
    fn collapses_blank_runs_and_trailing_spaces() {
        let raw = "First paragraph.   \n\n\n\nSecond paragraph.";
        let out = format_assistant_response(raw);
        assert_eq!(out, "First paragraph.\n\nSecond paragraph.");
    }

    #[test]
    fn normalizes_crlf_and_trims() {
        let out = format_assistant_response("  Hello there.\r\nSecond line.  ");
        assert_eq!(out, "Hello there.\nSecond line.");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(format_assistant_response("   \r\n "), "");
    }

    #[test]
    fn indented_block_counts_as_code() {
        let raw = "Layout:\n      key: value\nPlain again.";
        let out = format_assistant_response(raw);
        assert_eq!(out, "Layout:\n```text\n      key: value\n```\nPlain again.");
    }
}
