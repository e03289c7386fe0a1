use crate::extractor::PAGE_MARKER_PATTERN;
use crate::prompts::PAGE_EXTRACTION_PROMPT;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Line that separates sections after page markers are converted.
pub const SECTION_BREAK: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMarkerMode {
    SectionBreak,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCollapse {
    /// Every run of two or more spaces/tabs becomes one space.
    Aggressive,
    /// Only runs of five or more spaces shrink (to four), keeping column alignment.
    Conservative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleaningOptions {
    pub page_markers: PageMarkerMode,
    pub strip_structural_markers: bool,
    pub space_collapse: SpaceCollapse,
    /// Extra footer lines (case-insensitive regexes) to drop.
    pub footer_patterns: Vec<String>,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        Self {
            page_markers: PageMarkerMode::SectionBreak,
            strip_structural_markers: false,
            space_collapse: SpaceCollapse::Conservative,
            footer_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleaningStats {
    pub original_chars: usize,
    pub cleaned_chars: usize,
    pub reduction_percent: f64,
    pub page_markers_removed: usize,
}

static RE_PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?m)^[ \t]*{PAGE_MARKER_PATTERN}[ \t]*$")).unwrap());

static RE_INSTRUCTION_ECHO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:(?:here is|here's|below is) the (?:extracted|transcribed|full) text(?: (?:from|of) (?:this|the) (?:page|image|document))?[:.]?|(?:extract|transcribe) all (?:visible )?text (?:from|on) this (?:page|image).*|```[a-z]*)[ \t]*$",
    )
    .unwrap()
});

static PROMPT_LINES: Lazy<HashSet<String>> = Lazy::new(|| {
    PAGE_EXTRACTION_PROMPT
        .lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| line.len() >= 20)
        .collect()
});

static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:(?:page[ \t]+)?\d{1,4}(?:[ \t]*(?:of|/)[ \t]*\d{1,4})?|[-–—][ \t]*\d{1,4}[ \t]*[-–—])[ \t]*$",
    )
    .unwrap()
});

static RE_SYSTEM_FOOTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:generated by [^\n]{0,60}|scanned (?:with|by) [^\n]{0,60}|this page (?:is )?intentionally left blank\.?)[ \t]*$",
    )
    .unwrap()
});

static RE_STRUCTURAL_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[/?(?:TABLE|HANDWRITTEN|HANDWRITING|SIGNATURE)\]").unwrap());

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_AGGRESSIVE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());
static RE_CONSERVATIVE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r" {5,}").unwrap());

pub fn clean_text(raw: &str, options: &CleaningOptions) -> String {
    let text = normalise_line_endings(raw);
    let footers = detect_repeated_footers(&text);

    let text = strip_instruction_echoes(&text);
    let text = convert_page_markers(&text, options.page_markers);
    let text = strip_footer_noise(&text, &footers, &options.footer_patterns);
    let text = if options.strip_structural_markers {
        RE_STRUCTURAL_TAG.replace_all(&text, "").into_owned()
    } else {
        text
    };
    let text = trim_trailing_whitespace(&text);
    let text = collapse_inline_spaces(&text, options.space_collapse);
    let text = tidy_section_breaks(&text);
    let text = RE_BLANK_LINES.replace_all(&text, "\n\n");

    text.trim().to_string()
}

pub fn cleaning_stats(raw: &str, cleaned: &str) -> CleaningStats {
    let original_chars = raw.chars().count();
    let cleaned_chars = cleaned.chars().count();
    let reduction_percent = if original_chars == 0 {
        0.0
    } else {
        (original_chars.saturating_sub(cleaned_chars) as f64 / original_chars as f64) * 100.0
    };

    CleaningStats {
        original_chars,
        cleaned_chars,
        reduction_percent,
        page_markers_removed: RE_PAGE_MARKER.find_iter(raw).count(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn strip_instruction_echoes(input: &str) -> String {
    let without_phrases = RE_INSTRUCTION_ECHO.replace_all(input, "");
    without_phrases
        .lines()
        .filter(|line| !PROMPT_LINES.contains(&line.trim().to_lowercase()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn convert_page_markers(input: &str, mode: PageMarkerMode) -> String {
    let replacement = match mode {
        PageMarkerMode::SectionBreak => format!("\n{SECTION_BREAK}\n"),
        PageMarkerMode::Remove => String::new(),
    };
    RE_PAGE_MARKER
        .replace_all(input, replacement.as_str())
        .into_owned()
}

fn detect_repeated_footers(input: &str) -> HashSet<String> {
    let pages: Vec<&str> = RE_PAGE_MARKER
        .split(input)
        .filter(|page| !page.trim().is_empty())
        .collect();
    if pages.len() < 3 {
        return HashSet::new();
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    for page in &pages {
        let tail: HashSet<String> = page
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .rev()
            .take(2)
            .filter(|line| line.chars().count() <= 80 && !line.starts_with("[Page "))
            .map(str::to_string)
            .collect();
        for line in tail {
            *seen.entry(line).or_insert(0) += 1;
        }
    }

    let threshold = (pages.len() / 2 + 1).max(3);
    seen.into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(line, _)| line)
        .collect()
}

fn strip_footer_noise(input: &str, footers: &HashSet<String>, extra: &[String]) -> String {
    let extra: Vec<Regex> = extra
        .iter()
        .filter_map(|pattern| match Regex::new(&format!("(?i)^(?:{pattern})$")) {
            Ok(regex) => Some(regex),
            Err(error) => {
                tracing::warn!(pattern = %pattern, error = %error, "ignoring invalid footer pattern");
                None
            }
        })
        .collect();

    input
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return true;
            }
            !(footers.contains(trimmed)
                || RE_PAGE_NUMBER.is_match(line)
                || RE_SYSTEM_FOOTER.is_match(line)
                || extra.iter().any(|regex| regex.is_match(trimmed)))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_inline_spaces(input: &str, mode: SpaceCollapse) -> String {
    match mode {
        SpaceCollapse::Aggressive => RE_AGGRESSIVE_SPACES.replace_all(input, " ").into_owned(),
        SpaceCollapse::Conservative => RE_CONSERVATIVE_SPACES.replace_all(input, "    ").into_owned(),
    }
}

fn tidy_section_breaks(input: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut last_content_was_break = true;

    for line in input.lines() {
        if line.trim() == SECTION_BREAK {
            if last_content_was_break {
                continue;
            }
            last_content_was_break = true;
        } else if !line.trim().is_empty() {
            last_content_was_break = false;
        }
        kept.push(line);
    }

    while let Some(last) = kept.last() {
        let trimmed = last.trim();
        if trimmed.is_empty() || trimmed == SECTION_BREAK {
            kept.pop();
        } else {
            break;
        }
    }

    kept.join("\n")
}
