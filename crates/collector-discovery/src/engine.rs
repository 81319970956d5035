//! Interactive ground-truth correlation algorithm that turns
//! before/after scale frame captures into a [`ProtocolTemplate`].

use std::collections::BTreeMap;

use thiserror::Error;

use crate::template::{Encoding, FieldKind, FieldSpec, ProtocolTemplate, TemplateError, TemplateRepository};

/// Candidate frame delimiters tried in preference order; `CR LF` is
/// the fallback when no candidate explains enough of the captured
/// bytes.
const DELIMITER_CANDIDATES: &[&[u8]] = &[b"\r\n", b"\n", b"\r"];

/// A delimiter must explain at least this fraction of captured bytes
/// to be accepted outright.
const DELIMITER_COVERAGE_THRESHOLD: f64 = 0.95;

/// Frame length is rejected as unstable once observed lengths vary by
/// more than this many bytes.
const MAX_LENGTH_VARIANCE: usize = 2;

/// Numeric correlation must clear this Pearson `r` to be usable.
const MIN_NUMERIC_CORRELATION: f64 = 0.98;

/// Things that can go wrong while assembling a template from captures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `finish` was called before any frames were captured.
    #[error("no captures recorded")]
    NoCaptures,
    /// Framing could not be determined stably.
    #[error("framing is unstable: observed frame lengths vary by {variance} bytes (max {MAX_LENGTH_VARIANCE})")]
    UnstableFraming {
        /// Observed spread between the shortest and longest frame.
        variance: usize,
    },
    /// Persisting the accepted template failed.
    #[error("could not persist discovered template: {0}")]
    Repository(#[from] TemplateError),
}

/// `format_score`/`numeric_score`/overall breakdown from template
/// assembly (spec step 8).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceBreakdown {
    /// Fraction of captures the assembled template re-parses cleanly.
    pub format_score: f64,
    /// `100 * Pearson r` of the chosen numeric column against weight.
    pub numeric_score: f64,
    /// `min(format_score, numeric_score)`.
    pub overall: f64,
}

/// Result of [`DiscoverySession::finish`].
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    /// Confidence cleared the threshold; template is ready to persist.
    Accepted(ProtocolTemplate),
    /// Confidence fell short. The draft is returned for inspection,
    /// never persisted.
    Inconclusive {
        /// Best-effort template built from what was captured.
        draft: ProtocolTemplate,
        /// Score breakdown explaining the shortfall.
        confidence: ConfidenceBreakdown,
        /// Points at the weakest field or step.
        diagnostic: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnClass {
    Digit,
    Alpha,
    Space,
    Mixed,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// One operator-driven capture session: a baseline (empty scale) plus
/// a series of known-weight steps.
#[derive(Debug, Default)]
pub struct DiscoverySession {
    confidence_threshold: f64,
    baseline: Vec<Vec<u8>>,
    steps: Vec<(f64, Vec<Vec<u8>>)>,
}

impl DiscoverySession {
    /// Start a session. `confidence_threshold` is spec's default 85
    /// unless the caller overrides it.
    #[must_use]
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            baseline: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Record the baseline capture (empty scale).
    pub fn capture_baseline(&mut self, raw: &[u8]) {
        self.baseline.push(raw.to_vec());
    }

    /// Record a capture at a known weight.
    pub fn step(&mut self, weight_kg: f64, raw: &[u8]) {
        self.steps.push((weight_kg, vec![raw.to_vec()]));
    }

    /// Run the full algorithm (spec.md §4.8 steps 3-9) against
    /// everything captured so far.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoCaptures`] if nothing was captured,
    /// or [`DiscoveryError::UnstableFraming`] if frame lengths do not
    /// agree closely enough to fix a frame length.
    pub fn finish(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        if self.baseline.is_empty() && self.steps.is_empty() {
            return Err(DiscoveryError::NoCaptures);
        }

        // Step 1/2: sets in capture order, baseline first at weight 0.
        let mut raw_sets: Vec<(f64, Vec<u8>)> = Vec::new();
        for frame in &self.baseline {
            raw_sets.push((0.0, frame.clone()));
        }
        for (weight, frames) in &self.steps {
            for frame in frames {
                raw_sets.push((*weight, frame.clone()));
            }
        }

        // Step 3: framing.
        let delimiter = infer_delimiter(&raw_sets);
        let mut frames_by_set: Vec<(f64, Vec<Vec<u8>>)> = Vec::new();
        for (weight, raw) in &raw_sets {
            frames_by_set.push((*weight, split_frames(raw, &delimiter)));
        }
        let all_lengths: Vec<usize> = frames_by_set
            .iter()
            .flat_map(|(_, frames)| frames.iter().map(Vec::len))
            .collect();
        let (frame_length, variance) = mode_and_variance(&all_lengths);
        if variance > MAX_LENGTH_VARIANCE {
            return Err(DiscoveryError::UnstableFraming { variance });
        }

        // Only one prompted weight step: always inconclusive (spec
        // step 2's implicit requirement, made explicit in §8).
        if self.steps.len() < 2 {
            let draft = ProtocolTemplate {
                template_id: String::new(),
                name: "draft".into(),
                delimiter,
                encoding: Encoding::Ascii,
                fields: Vec::new(),
                confidence_score: 0.0,
            };
            return Ok(DiscoveryOutcome::Inconclusive {
                draft,
                confidence: ConfidenceBreakdown {
                    format_score: 0.0,
                    numeric_score: 0.0,
                    overall: 0.0,
                },
                diagnostic: "at least two known-weight steps are required".into(),
            });
        }

        // Step 4: per-column classification across every frame,
        // regardless of which set it came from.
        let representative: Vec<(f64, Vec<u8>)> = frames_by_set
            .iter()
            .map(|(weight, frames)| (*weight, representative_frame(frames, frame_length)))
            .collect();
        let all_frames: Vec<&Vec<u8>> = frames_by_set.iter().flat_map(|(_, f)| f.iter()).collect();
        let classes: Vec<ColumnClass> = (0..frame_length)
            .map(|offset| classify_column(&all_frames, offset))
            .collect();

        let alpha_runs = contiguous_runs(&classes, ColumnClass::Alpha);
        let digit_runs = contiguous_runs(&classes, ColumnClass::Digit);

        // Step 5: numeric extraction — best digit run by correlation,
        // maximising Pearson `r` then minimising absolute error against
        // the known weights to break ties. Pearson `r` is invariant
        // under the uniform rescaling a `decimal_places` guess applies,
        // so every candidate `d` for a run ties on `r` alone; the
        // absolute-error tie-break is what actually picks the right
        // scale. When the captured text already carries an explicit
        // `.`, its fractional-digit count is authoritative and no
        // guessing is needed.
        let weights: Vec<f64> = representative.iter().map(|(w, _)| *w).collect();
        let mut best: Option<(Span, u8, f64)> = None;
        for run in &digit_runs {
            let preceding = alpha_runs.iter().filter(|a| a.end <= run.start).max_by_key(|a| a.end);
            let following = alpha_runs.iter().filter(|a| a.start >= run.end).min_by_key(|a| a.start);
            let numeric_start = preceding.map_or(0, |a| a.end + 1).min(run.start);
            let numeric_end = following.map_or(frame_length, |a| a.start).max(run.end);

            let explicit_decimal_places =
                representative.iter().find_map(|(_, frame)| fractional_digit_count(&frame[numeric_start..numeric_end]));
            let candidates: Vec<u8> = explicit_decimal_places.map_or_else(|| (0..=4u8).collect(), |d| vec![d]);

            let mut run_best: Option<(u8, f64, f64)> = None;
            for d in candidates {
                let values: Option<Vec<f64>> = representative
                    .iter()
                    .map(|(_, frame)| parse_numeric_field(&frame[numeric_start..numeric_end], d))
                    .collect();
                let Some(values) = values else { continue };
                let r = pearson(&weights, &values);
                let abs_error: f64 = values.iter().zip(&weights).map(|(v, w)| (v - w).abs()).sum();
                let better = match run_best {
                    None => true,
                    Some((_, best_r, best_err)) => r > best_r || ((r - best_r).abs() < 1e-9 && abs_error < best_err),
                };
                if better {
                    run_best = Some((d, r, abs_error));
                }
            }

            if let Some((d, r, _)) = run_best {
                if best.is_none_or(|(_, _, best_r)| r > best_r) {
                    best = Some((Span { start: numeric_start, end: numeric_end }, d, r));
                }
            }
        }

        let Some((numeric_span, decimal_places, numeric_r)) = best else {
            let draft = ProtocolTemplate {
                template_id: String::new(),
                name: "draft".into(),
                delimiter,
                encoding: Encoding::Ascii,
                fields: Vec::new(),
                confidence_score: 0.0,
            };
            return Ok(DiscoveryOutcome::Inconclusive {
                draft,
                confidence: ConfidenceBreakdown { format_score: 0.0, numeric_score: 0.0, overall: 0.0 },
                diagnostic: "no byte range correlates with the prompted weights".into(),
            });
        };

        // Step 6: stability marker — the alpha run immediately before
        // the numeric field, if it is short and has a small alphabet.
        let marker_run = alpha_runs
            .iter()
            .filter(|a| a.end <= numeric_span.start && (2..=3).contains(&a.len()))
            .max_by_key(|a| a.end);
        let marker_field = marker_run.and_then(|run| build_marker_field(&representative, *run));

        // Step 7: unit field — the alpha run immediately after the
        // numeric field, if its text is identical everywhere.
        let unit_run = alpha_runs.iter().find(|a| a.start >= numeric_span.end);
        let unit_field = unit_run.and_then(|run| build_unit_field(&representative, *run));

        // Step 8: template assembly.
        let mut fields = Vec::new();
        if let Some(marker) = &marker_field {
            fields.push(marker.clone());
        }
        fields.push(FieldSpec {
            name: "weight".into(),
            start: numeric_span.start,
            length: numeric_span.len(),
            kind: FieldKind::Numeric { decimal_places },
        });
        if let Some(unit) = &unit_field {
            fields.push(unit.clone());
        }

        let draft = ProtocolTemplate {
            template_id: String::new(),
            name: "draft".into(),
            delimiter,
            encoding: Encoding::Ascii,
            fields,
            confidence_score: 0.0,
        };

        let format_score = re_apply_success_rate(&draft, &frames_by_set);
        let numeric_score = (numeric_r * 100.0).clamp(0.0, 100.0);
        let overall = format_score.min(numeric_score);
        let confidence = ConfidenceBreakdown { format_score, numeric_score, overall };

        if overall >= self.confidence_threshold {
            let mut template = draft;
            template.confidence_score = overall;
            Ok(DiscoveryOutcome::Accepted(template))
        } else {
            let weakest = if format_score <= numeric_score { "framing/lookup fields" } else { "weight field" };
            Ok(DiscoveryOutcome::Inconclusive {
                draft,
                confidence,
                diagnostic: format!(
                    "confidence {overall:.1} below threshold {:.1}; weakest component: {weakest}",
                    self.confidence_threshold
                ),
            })
        }
    }
}

fn classify_column(frames: &[&Vec<u8>], offset: usize) -> ColumnClass {
    let mut saw_digit = false;
    let mut saw_alpha = false;
    let mut saw_space = false;
    for frame in frames {
        let Some(&byte) = frame.get(offset) else { return ColumnClass::Mixed };
        match byte {
            b'0'..=b'9' | b'.' | b'-' => saw_digit = true,
            b' ' => saw_space = true,
            b if b.is_ascii_alphabetic() => saw_alpha = true,
            _ => return ColumnClass::Mixed,
        }
    }
    match (saw_digit, saw_alpha, saw_space) {
        (true, false, false) => ColumnClass::Digit,
        (false, true, false) => ColumnClass::Alpha,
        (false, false, true) => ColumnClass::Space,
        _ => ColumnClass::Mixed,
    }
}

fn contiguous_runs(classes: &[ColumnClass], target: ColumnClass) -> Vec<Span> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, class) in classes.iter().enumerate() {
        if *class == target {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            runs.push(Span { start: s, end: i });
        }
    }
    if let Some(s) = start {
        runs.push(Span { start: s, end: classes.len() });
    }
    runs
}

fn infer_delimiter(sets: &[(f64, Vec<u8>)]) -> Vec<u8> {
    let total_bytes: usize = sets.iter().map(|(_, raw)| raw.len()).sum();
    if total_bytes == 0 {
        return DELIMITER_CANDIDATES[0].to_vec();
    }
    let mut best: Option<(Vec<u8>, f64)> = None;
    for candidate in DELIMITER_CANDIDATES {
        let occurrences: usize = sets.iter().map(|(_, raw)| count_occurrences(raw, candidate)).sum();
        let covered = occurrences * candidate.len();
        let coverage = covered as f64 / total_bytes as f64;
        if best.as_ref().is_none_or(|(_, best_cov)| coverage > *best_cov) {
            best = Some((candidate.to_vec(), coverage));
        }
    }
    match best {
        Some((delim, coverage)) if coverage >= DELIMITER_COVERAGE_THRESHOLD => delim,
        _ => DELIMITER_CANDIDATES[0].to_vec(),
    }
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn split_frames(raw: &[u8], delimiter: &[u8]) -> Vec<Vec<u8>> {
    if delimiter.is_empty() {
        return vec![raw.to_vec()];
    }
    let mut frames = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + delimiter.len() <= raw.len() {
        if &raw[i..i + delimiter.len()] == delimiter {
            frames.push(raw[start..i].to_vec());
            i += delimiter.len();
            start = i;
        } else {
            i += 1;
        }
    }
    if start < raw.len() {
        frames.push(raw[start..].to_vec());
    }
    frames.retain(|f| !f.is_empty());
    frames
}

fn mode_and_variance(lengths: &[usize]) -> (usize, usize) {
    if lengths.is_empty() {
        return (0, 0);
    }
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for len in lengths {
        *counts.entry(*len).or_insert(0) += 1;
    }
    let mode = *counts.iter().max_by_key(|(_, count)| **count).map(|(len, _)| len).unwrap();
    let min = *lengths.iter().min().unwrap();
    let max = *lengths.iter().max().unwrap();
    (mode, max - min)
}

/// The most common exact frame within a set, padded/truncated to
/// `frame_length` (captures occasionally clip a trailing byte).
fn representative_frame(frames: &[Vec<u8>], frame_length: usize) -> Vec<u8> {
    let mut counts: BTreeMap<&Vec<u8>, usize> = BTreeMap::new();
    for frame in frames {
        *counts.entry(frame).or_insert(0) += 1;
    }
    let chosen = counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map_or_else(Vec::new, |(frame, _)| frame.clone());
    let mut padded = chosen;
    padded.resize(frame_length, b' ');
    padded
}

/// Number of digits after an explicit `.` in `raw`, if any. `None`
/// when the text has no decimal point (the caller must then guess
/// `decimal_places` some other way).
fn fractional_digit_count(raw: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    let (_, frac) = text.split_once('.')?;
    let digits = frac.chars().take_while(char::is_ascii_digit).count();
    u8::try_from(digits).ok()
}

fn parse_numeric_field(raw: &[u8], decimal_places: u8) -> Option<f64> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if text.is_empty() || !text.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if text.contains('.') {
        text.parse::<f64>().ok()
    } else {
        let negative = text.starts_with('-');
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        let parsed: i64 = digits.parse().ok()?;
        let scale = 10f64.powi(i32::from(decimal_places));
        Some(if negative { -(parsed as f64) / scale } else { parsed as f64 / scale })
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0)
}

fn build_marker_field(representative: &[(f64, Vec<u8>)], run: Span) -> Option<FieldSpec> {
    let texts: Vec<(f64, String)> = representative
        .iter()
        .map(|(weight, frame)| (*weight, String::from_utf8_lossy(&frame[run.start..run.end]).trim().to_string()))
        .collect();
    let distinct: Vec<&String> = {
        let mut seen = Vec::new();
        for (_, text) in &texts {
            if !seen.contains(&text) {
                seen.push(text);
            }
        }
        seen
    };
    if distinct.len() < 2 || distinct.len() > 4 {
        return None;
    }
    let mut table = BTreeMap::new();
    if distinct.len() == 2 {
        let baseline_symbol = texts.iter().find(|(w, _)| *w == 0.0).map(|(_, t)| t.clone());
        for symbol in &distinct {
            let label = if Some((*symbol).clone()) == baseline_symbol { "unstable" } else { "stable" };
            table.insert((*symbol).clone(), label.to_string());
        }
    } else {
        for symbol in &distinct {
            table.insert((*symbol).clone(), (*symbol).clone());
        }
    }
    Some(FieldSpec {
        name: "stability".into(),
        start: run.start,
        length: run.len(),
        kind: FieldKind::Lookup { table },
    })
}

fn build_unit_field(representative: &[(f64, Vec<u8>)], run: Span) -> Option<FieldSpec> {
    let mut texts = representative
        .iter()
        .map(|(_, frame)| String::from_utf8_lossy(&frame[run.start..run.end]).trim().to_string());
    let first = texts.next()?;
    if first.is_empty() || !texts.all(|t| t == first) {
        return None;
    }
    Some(FieldSpec { name: "unit".into(), start: run.start, length: run.len(), kind: FieldKind::Literal })
}

fn re_apply_success_rate(template: &ProtocolTemplate, frames_by_set: &[(f64, Vec<Vec<u8>>)]) -> f64 {
    let mut total = 0usize;
    let mut ok = 0usize;
    for (_, frames) in frames_by_set {
        for frame in frames {
            total += 1;
            if field_decode_ok(template, frame) {
                ok += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        100.0 * ok as f64 / total as f64
    }
}

fn field_decode_ok(template: &ProtocolTemplate, frame: &[u8]) -> bool {
    for field in &template.fields {
        let end = field.start + field.length;
        if end > frame.len() {
            return false;
        }
        let raw = &frame[field.start..end];
        match &field.kind {
            FieldKind::Ignore | FieldKind::Literal => {}
            FieldKind::Lookup { table } => {
                let key = String::from_utf8_lossy(raw).trim().to_string();
                if !table.contains_key(&key) {
                    return false;
                }
            }
            FieldKind::Numeric { decimal_places } => {
                if parse_numeric_field(raw, *decimal_places).is_none() {
                    return false;
                }
            }
        }
    }
    true
}

/// Drives `DiscoverySession`s to completion and persists accepted
/// templates into a [`TemplateRepository`].
pub struct DiscoveryEngine<'a> {
    repository: &'a TemplateRepository,
    confidence_threshold: f64,
}

impl<'a> DiscoveryEngine<'a> {
    /// Bind an engine to a repository and confidence threshold (spec
    /// default 85).
    #[must_use]
    pub fn new(repository: &'a TemplateRepository, confidence_threshold: f64) -> Self {
        Self { repository, confidence_threshold }
    }

    /// Start a new interactive session.
    #[must_use]
    pub fn start_session(&self) -> DiscoverySession {
        DiscoverySession::new(self.confidence_threshold)
    }

    /// Finish a session and, if accepted, persist the template under
    /// `template_id` with display name `name`.
    ///
    /// # Errors
    ///
    /// Propagates [`DiscoveryError`] from [`DiscoverySession::finish`]
    /// or from the repository `put`.
    pub fn finish(
        &self,
        session: &DiscoverySession,
        template_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        match session.finish()? {
            DiscoveryOutcome::Accepted(mut template) => {
                template.template_id = template_id.into();
                template.name = name.into();
                self.repository.put(template.clone())?;
                Ok(DiscoveryOutcome::Accepted(template))
            }
            other => Ok(other),
        }
    }
}
