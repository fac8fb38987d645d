// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-kind answer validators.
//!
//! Every validator is a pure function of `(answer, config)`; the only
//! external input is the injected [`RandomSource`] used by
//! `looped_almost_done`. Outcomes are values: a malformed answer is an
//! ordinary failure with [`FailureReason::InvalidFormat`], never an error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::maze::TrialKind;
use crate::random::RandomSource;

const COLOR_TOLERANCE: f64 = 5.0;
const TRACE_COVERAGE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    UnknownTrialKind,
    InvalidFormat,
    WrongTileCount,
    IncorrectTiles,
    SumMismatch,
    ItemCountMismatch,
    TracedTooSlowly,
    PathIncomplete,
    IncorrectTiming,
    IncorrectAnswer,
    LeftPage,
    InsufficientWait,
    IncompleteSteps,
    StepIncorrect,
    ColorMismatch,
    ClickImprecise,
    NotRevealed,
    InsufficientCues,
    IncompleteChain,
    AnsweredTooQuickly,
    PagesNotReviewed,
    ReviewAnswerIncorrect,
    WrongKeySequence,
    TimingWindowMissed,
    WrongWord,
    WrongTimestamp,
    FinalVerificationFailed,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTrialKind => "UnknownTrialKind",
            Self::InvalidFormat => "InvalidFormat",
            Self::WrongTileCount => "WrongTileCount",
            Self::IncorrectTiles => "IncorrectTiles",
            Self::SumMismatch => "SumMismatch",
            Self::ItemCountMismatch => "ItemCountMismatch",
            Self::TracedTooSlowly => "TracedTooSlowly",
            Self::PathIncomplete => "PathIncomplete",
            Self::IncorrectTiming => "IncorrectTiming",
            Self::IncorrectAnswer => "IncorrectAnswer",
            Self::LeftPage => "LeftPage",
            Self::InsufficientWait => "InsufficientWait",
            Self::IncompleteSteps => "IncompleteSteps",
            Self::StepIncorrect => "StepIncorrect",
            Self::ColorMismatch => "ColorMismatch",
            Self::ClickImprecise => "ClickImprecise",
            Self::NotRevealed => "NotRevealed",
            Self::InsufficientCues => "InsufficientCues",
            Self::IncompleteChain => "IncompleteChain",
            Self::AnsweredTooQuickly => "AnsweredTooQuickly",
            Self::PagesNotReviewed => "PagesNotReviewed",
            Self::ReviewAnswerIncorrect => "ReviewAnswerIncorrect",
            Self::WrongKeySequence => "WrongKeySequence",
            Self::TimingWindowMissed => "TimingWindowMissed",
            Self::WrongWord => "WrongWord",
            Self::WrongTimestamp => "WrongTimestamp",
            Self::FinalVerificationFailed => "FinalVerificationFailed",
        }
    }

    /// Visitor-facing text.
    pub fn message(self) -> &'static str {
        match self {
            Self::UnknownTrialKind => "Unknown trial type",
            Self::InvalidFormat => "Invalid answer format",
            Self::WrongTileCount => "Wrong number of tiles selected",
            Self::IncorrectTiles => "Incorrect tiles selected",
            Self::SumMismatch => "Sum does not equal target",
            Self::ItemCountMismatch => "Wrong number of items selected",
            Self::TracedTooSlowly => "Path traced too slowly",
            Self::PathIncomplete => "Path incomplete",
            Self::IncorrectTiming => "Incorrect timing",
            Self::IncorrectAnswer => "Incorrect answer",
            Self::LeftPage => "Progress lost due to leaving page",
            Self::InsufficientWait => "Insufficient wait time",
            Self::IncompleteSteps => "All steps must be completed",
            Self::StepIncorrect => "A verification step was incorrect",
            Self::ColorMismatch => "Color match not precise enough",
            Self::ClickImprecise => "Click not precise enough",
            Self::NotRevealed => "Image not fully revealed",
            Self::InsufficientCues => "Insufficient sound cue interactions",
            Self::IncompleteChain => "Incomplete math chain",
            Self::AnsweredTooQuickly => "Answers submitted too quickly",
            Self::PagesNotReviewed => "Must review all pages",
            Self::ReviewAnswerIncorrect => "Incorrect answer to review question",
            Self::WrongKeySequence => "Incorrect key sequence",
            Self::TimingWindowMissed => "Timing window missed",
            Self::WrongWord => "Incorrect word found",
            Self::WrongTimestamp => "Word found at wrong timestamp",
            Self::FinalVerificationFailed => "Final verification failed",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResult {
    pub success: bool,
    pub reason: Option<FailureReason>,
    pub restart_on_fail: bool,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            success: true,
            reason: None,
            restart_on_fail: false,
        }
    }

    pub fn fail(reason: FailureReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            restart_on_fail: false,
        }
    }

    pub fn fail_and_restart(reason: FailureReason) -> Self {
        Self {
            restart_on_fail: true,
            ..Self::fail(reason)
        }
    }
}

/// Judges `answer` against the trial's `config`.
pub fn validate_trial_answer(
    kind: &TrialKind,
    answer: &Value,
    config: &Value,
    rng: &dyn RandomSource,
) -> ValidationResult {
    let outcome = match kind {
        TrialKind::ImageHunt => image_hunt(answer, config),
        TrialKind::DragSum => drag_sum(answer, config),
        TrialKind::TracePath => trace_path(answer, config),
        TrialKind::AudioGate => audio_gate(answer, config),
        TrialKind::CaptchaLoopback => captcha_loopback(answer, config),
        TrialKind::LoadingAbyss => loading_abyss(answer, config),
        TrialKind::MultiLayerCaptcha => multi_layer_captcha(answer, config),
        TrialKind::ColorGradientMatch => color_gradient_match(answer, config),
        TrialKind::PixelPerfectClick => pixel_perfect_click(answer, config),
        TrialKind::SlowReveal => slow_reveal(answer, config),
        TrialKind::InvisibleMaze => invisible_maze(answer, config),
        TrialKind::MathChain => math_chain(answer, config),
        TrialKind::DocumentReview => document_review(answer, config),
        TrialKind::KeypressCombo => keypress_combo(answer, config),
        TrialKind::VideoFrameSearch => video_frame_search(answer, config),
        TrialKind::LoopedAlmostDone => looped_almost_done(answer, config, rng),
        TrialKind::Unknown(_) => return ValidationResult::fail(FailureReason::UnknownTrialKind),
    };
    outcome.unwrap_or_else(ValidationResult::fail)
}

type Outcome = Result<ValidationResult, FailureReason>;

fn parse<T: DeserializeOwned>(value: &Value) -> Result<T, FailureReason> {
    T::deserialize(value).map_err(|_| FailureReason::InvalidFormat)
}

/// An absent config means "all defaults".
fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, FailureReason> {
    if config.is_null() {
        return parse(&Value::Object(Map::new()));
    }
    parse(config)
}

/// Loose equality: numbers compare by value so `42` and `42.0` agree.
pub(crate) fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn check(ok: bool, reason: FailureReason) -> Outcome {
    Ok(if ok {
        ValidationResult::pass()
    } else {
        ValidationResult::fail(reason)
    })
}

#[derive(Deserialize)]
struct ImageHuntConfig {
    #[serde(default)]
    pattern: Vec<i64>,
}

fn image_hunt(answer: &Value, config: &Value) -> Outcome {
    let cfg: ImageHuntConfig = parse_config(config)?;
    let mut selected: Vec<i64> = parse(answer)?;
    let mut required = cfg.pattern;
    if selected.len() != required.len() {
        return Ok(ValidationResult::fail(FailureReason::WrongTileCount));
    }
    selected.sort_unstable();
    required.sort_unstable();
    check(selected == required, FailureReason::IncorrectTiles)
}

#[derive(Deserialize)]
struct DragSumConfig {
    target: f64,
    #[serde(default)]
    exactly: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DragSumAnswer {
    selected_items: Vec<f64>,
}

fn drag_sum(answer: &Value, config: &Value) -> Outcome {
    let cfg: DragSumConfig = parse_config(config)?;
    let ans: DragSumAnswer = parse(answer)?;
    let sum: f64 = ans.selected_items.iter().sum();
    if sum != cfg.target {
        return Ok(ValidationResult::fail(FailureReason::SumMismatch));
    }
    match cfg.exactly {
        Some(n) if n > 0 && ans.selected_items.len() != n => {
            Ok(ValidationResult::fail(FailureReason::ItemCountMismatch))
        }
        _ => Ok(ValidationResult::pass()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TracePathConfig {
    #[serde(default)]
    path: Vec<Value>,
    #[serde(default = "default_min_velocity")]
    min_velocity: f64,
}

fn default_min_velocity() -> f64 {
    50.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TracePathAnswer {
    user_path: Vec<Value>,
    avg_velocity: f64,
}

fn trace_path(answer: &Value, config: &Value) -> Outcome {
    let cfg: TracePathConfig = parse_config(config)?;
    let ans: TracePathAnswer = parse(answer)?;
    if ans.avg_velocity < cfg.min_velocity {
        return Ok(ValidationResult::fail(FailureReason::TracedTooSlowly));
    }
    check(
        ans.user_path.len() as f64 >= cfg.path.len() as f64 * TRACE_COVERAGE,
        FailureReason::PathIncomplete,
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioGateConfig {
    correct_timestamp: f64,
    #[serde(default = "default_audio_tolerance")]
    tolerance_ms: f64,
}

fn default_audio_tolerance() -> f64 {
    500.0
}

#[derive(Deserialize)]
struct TimestampAnswer {
    timestamp: f64,
}

fn audio_gate(answer: &Value, config: &Value) -> Outcome {
    let cfg: AudioGateConfig = parse_config(config)?;
    let ans: TimestampAnswer = parse(answer)?;
    check(
        (ans.timestamp - cfg.correct_timestamp).abs() <= cfg.tolerance_ms,
        FailureReason::IncorrectTiming,
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpectedAnswerConfig {
    #[serde(default)]
    expected_answer: Value,
}

fn captcha_loopback(answer: &Value, config: &Value) -> Outcome {
    let cfg: ExpectedAnswerConfig = parse_config(config)?;
    if json_eq(answer, &cfg.expected_answer) {
        Ok(ValidationResult::pass())
    } else {
        Ok(ValidationResult::fail_and_restart(FailureReason::IncorrectAnswer))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingAbyssConfig {
    #[serde(default = "default_abyss_wait")]
    min_ms: f64,
}

fn default_abyss_wait() -> f64 {
    30_000.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingAbyssAnswer {
    #[serde(default)]
    required_ms: Value,
    #[serde(default)]
    blur_events: u64,
}

fn loading_abyss(answer: &Value, config: &Value) -> Outcome {
    let cfg: LoadingAbyssConfig = parse_config(config)?;
    let ans: LoadingAbyssAnswer = parse(answer)?;
    // A wait the client cannot report counts as having left the page.
    let Some(waited) = ans.required_ms.as_f64().filter(|_| ans.blur_events == 0) else {
        return Ok(ValidationResult::fail_and_restart(FailureReason::LeftPage));
    };
    check(waited >= cfg.min_ms, FailureReason::InsufficientWait)
}

#[derive(Deserialize)]
struct MultiLayerConfig {
    steps: Vec<ExpectedAnswerConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiLayerAnswer {
    completed_steps: Vec<Value>,
}

fn multi_layer_captcha(answer: &Value, config: &Value) -> Outcome {
    let cfg: MultiLayerConfig = parse_config(config)?;
    let ans: MultiLayerAnswer = parse(answer)?;
    if ans.completed_steps.len() != cfg.steps.len() {
        return Ok(ValidationResult::fail_and_restart(FailureReason::IncompleteSteps));
    }
    let all_match = cfg
        .steps
        .iter()
        .zip(&ans.completed_steps)
        .all(|(step, given)| json_eq(given, &step.expected_answer));
    if all_match {
        Ok(ValidationResult::pass())
    } else {
        Ok(ValidationResult::fail_and_restart(FailureReason::StepIncorrect))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rgb {
    r: u32,
    g: u32,
    b: u32,
}

/// Parses `rgb(r, g, b)` with decimal channels.
pub(crate) fn parse_rgb(s: &str) -> Option<Rgb> {
    let inner = s.trim().strip_prefix("rgb(")?.strip_suffix(')')?;
    let mut parts = inner.split(',').map(|p| {
        let p = p.trim();
        if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        p.parse::<u32>().ok()
    });
    let rgb = Rgb {
        r: parts.next()??,
        g: parts.next()??,
        b: parts.next()??,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(rgb)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColorConfig {
    target_color: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColorAnswer {
    selected_color: String,
}

fn color_gradient_match(answer: &Value, config: &Value) -> Outcome {
    let cfg: ColorConfig = parse_config(config)?;
    let ans: ColorAnswer = parse(answer)?;
    let target = parse_rgb(&cfg.target_color).ok_or(FailureReason::InvalidFormat)?;
    let selected = parse_rgb(&ans.selected_color).ok_or(FailureReason::InvalidFormat)?;
    let dr = f64::from(target.r) - f64::from(selected.r);
    let dg = f64::from(target.g) - f64::from(selected.g);
    let db = f64::from(target.b) - f64::from(selected.b);
    check(
        (dr * dr + dg * dg + db * db).sqrt() <= COLOR_TOLERANCE,
        FailureReason::ColorMismatch,
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PixelConfig {
    target_x: f64,
    target_y: f64,
    #[serde(default = "default_pixel_tolerance")]
    tolerance_px: f64,
}

fn default_pixel_tolerance() -> f64 {
    3.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PixelAnswer {
    click_x: f64,
    click_y: f64,
}

fn pixel_perfect_click(answer: &Value, config: &Value) -> Outcome {
    let cfg: PixelConfig = parse_config(config)?;
    let ans: PixelAnswer = parse(answer)?;
    let distance = (ans.click_x - cfg.target_x).hypot(ans.click_y - cfg.target_y);
    check(distance <= cfg.tolerance_px, FailureReason::ClickImprecise)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlowRevealConfig {
    #[serde(default = "default_reveal_ms")]
    min_reveal_ms: f64,
}

fn default_reveal_ms() -> f64 {
    60_000.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlowRevealAnswer {
    reveal_time_ms: f64,
}

fn slow_reveal(answer: &Value, config: &Value) -> Outcome {
    let cfg: SlowRevealConfig = parse_config(config)?;
    let ans: SlowRevealAnswer = parse(answer)?;
    check(ans.reveal_time_ms >= cfg.min_reveal_ms, FailureReason::NotRevealed)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvisibleMazeConfig {
    #[serde(default)]
    required_cues: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvisibleMazeAnswer {
    #[serde(default)]
    sound_cues: Vec<Value>,
}

fn invisible_maze(answer: &Value, config: &Value) -> Outcome {
    let cfg: InvisibleMazeConfig = parse_config(config)?;
    let ans: InvisibleMazeAnswer = parse(answer)?;
    check(
        ans.sound_cues.len() >= cfg.required_cues,
        FailureReason::InsufficientCues,
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MathChainConfig {
    expected_answers: Vec<Value>,
    #[serde(default)]
    min_delay_ms: f64,
}

#[derive(Deserialize)]
struct MathChainAnswer {
    answers: Vec<Value>,
    #[serde(default)]
    delays: Vec<f64>,
}

fn math_chain(answer: &Value, config: &Value) -> Outcome {
    let cfg: MathChainConfig = parse_config(config)?;
    let ans: MathChainAnswer = parse(answer)?;
    if ans.answers.len() != cfg.expected_answers.len() {
        return Ok(ValidationResult::fail(FailureReason::IncompleteChain));
    }
    if ans.delays.len() < ans.answers.len() {
        return Err(FailureReason::InvalidFormat);
    }
    for ((given, expected), delay) in ans.answers.iter().zip(&cfg.expected_answers).zip(&ans.delays) {
        if !json_eq(given, expected) {
            return Ok(ValidationResult::fail(FailureReason::IncorrectAnswer));
        }
        if *delay < cfg.min_delay_ms {
            return Ok(ValidationResult::fail(FailureReason::AnsweredTooQuickly));
        }
    }
    Ok(ValidationResult::pass())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentReviewConfig {
    #[serde(default)]
    expected_answers: Map<String, Value>,
    #[serde(default = "default_required_pages")]
    required_pages: f64,
}

fn default_required_pages() -> f64 {
    5.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentReviewAnswer {
    #[serde(default)]
    answers: Map<String, Value>,
    pages_scrolled: f64,
}

fn document_review(answer: &Value, config: &Value) -> Outcome {
    let cfg: DocumentReviewConfig = parse_config(config)?;
    let ans: DocumentReviewAnswer = parse(answer)?;
    if ans.pages_scrolled < cfg.required_pages {
        return Ok(ValidationResult::fail(FailureReason::PagesNotReviewed));
    }
    let all_match = cfg.expected_answers.iter().all(|(question, expected)| {
        ans.answers
            .get(question)
            .is_some_and(|given| json_eq(given, expected))
    });
    check(all_match, FailureReason::ReviewAnswerIncorrect)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeypressConfig {
    expected_sequence: Vec<String>,
    #[serde(default = "default_key_window")]
    window_ms: f64,
}

fn default_key_window() -> f64 {
    50.0
}

#[derive(Deserialize)]
struct KeypressAnswer {
    sequence: Vec<String>,
    #[serde(default)]
    timings: Vec<f64>,
}

fn keypress_combo(answer: &Value, config: &Value) -> Outcome {
    let cfg: KeypressConfig = parse_config(config)?;
    let ans: KeypressAnswer = parse(answer)?;
    if ans.sequence != cfg.expected_sequence {
        return Ok(ValidationResult::fail(FailureReason::WrongKeySequence));
    }
    if ans.timings.len() < ans.sequence.len() {
        return Err(FailureReason::InvalidFormat);
    }
    let within_window = ans.timings[..ans.sequence.len()]
        .windows(2)
        .all(|pair| (pair[1] - pair[0]).abs() <= cfg.window_ms);
    check(within_window, FailureReason::TimingWindowMissed)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoFrameConfig {
    expected_word: String,
    expected_timestamp: f64,
    #[serde(default = "default_frame_tolerance")]
    tolerance_ms: f64,
}

fn default_frame_tolerance() -> f64 {
    1_000.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoFrameAnswer {
    found_word: String,
    timestamp: f64,
}

fn video_frame_search(answer: &Value, config: &Value) -> Outcome {
    let cfg: VideoFrameConfig = parse_config(config)?;
    let ans: VideoFrameAnswer = parse(answer)?;
    if ans.found_word != cfg.expected_word {
        return Ok(ValidationResult::fail(FailureReason::WrongWord));
    }
    check(
        (ans.timestamp - cfg.expected_timestamp).abs() <= cfg.tolerance_ms,
        FailureReason::WrongTimestamp,
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopedAlmostDoneConfig {
    #[serde(default = "default_final_loopback")]
    loopback_chance: f64,
}

fn default_final_loopback() -> f64 {
    0.5
}

fn looped_almost_done(answer: &Value, config: &Value, rng: &dyn RandomSource) -> Outcome {
    let cfg: LoopedAlmostDoneConfig = parse_config(config)?;
    let is_final = answer.get("step").and_then(Value::as_str) == Some("final");
    if is_final && rng.draw_unit() < cfg.loopback_chance {
        return Ok(ValidationResult::fail_and_restart(
            FailureReason::FinalVerificationFailed,
        ));
    }
    Ok(ValidationResult::pass())
}
