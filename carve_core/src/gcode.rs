//! G-code parser and interpreter (RS274/NGC subset).
//!
//! Operates on an upper-cased, whitespace-stripped line. Execution is four
//! strictly ordered phases: block initialisation, word ingest, validation
//! with pre-computation, and commit. Any failure aborts the block before
//! the commit phase, leaving parser state untouched.
//!
//! Modal groups are enums; a per-block bitset records which groups were
//! assigned so a second member of the same group fails the block.

use bitflags::bitflags;

use carve_common::consts::{
    MAX_LINE_NUMBER, MM_PER_INCH, N_AXIS, X_AXIS, Y_AXIS, Z_AXIS,
};
use carve_common::nvs::{self, COORD_G28, COORD_G30};
use carve_common::status::Status;
use carve_motion::planner::{Condition, PlanLineData};

use crate::machine::Machine;

/// Axis index carrying the dynamic tool-length offset.
const TOOL_LENGTH_OFFSET_AXIS: usize = Z_AXIS;

// ─── Modal Groups ───────────────────────────────────────────────────

/// Motion modal group (NIST group 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    /// G0 rapid positioning.
    #[default]
    Seek,
    /// G1 linear feed.
    Linear,
    /// G2 clockwise arc.
    CwArc,
    /// G3 counter-clockwise arc.
    CcwArc,
    /// G38.2 probe toward, error on miss.
    ProbeToward,
    /// G38.3 probe toward, no error.
    ProbeTowardNoError,
    /// G38.4 probe away, error on miss.
    ProbeAway,
    /// G38.5 probe away, no error.
    ProbeAwayNoError,
    /// G80 motion cancelled.
    None,
}

/// Feed-rate modal group (group 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    /// G94.
    #[default]
    UnitsPerMin,
    /// G93: F is moves-per-minute.
    InverseTime,
}

/// Units modal group (group 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    /// G21.
    #[default]
    Mm,
    /// G20: axis, offset, and feed words arrive in inches.
    Inches,
}

/// Distance modal group (group 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    /// G90.
    #[default]
    Absolute,
    /// G91.
    Incremental,
}

/// Program-flow modal group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    /// M0 (and M1, treated identically without an optional-stop switch).
    Paused,
    /// M2.
    CompletedM2,
    /// M30.
    CompletedM30,
}

/// Spindle modal group (M group 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleState {
    #[default]
    Disable,
    Cw,
    Ccw,
}

bitflags! {
    /// Coolant modal state (M group 8). M7 and M8 may combine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CoolantState: u8 {
        const MIST  = 0x01;
        const FLOOD = 0x02;
    }
}

/// Non-modal commands (group 0); apply to this block only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonModal {
    #[default]
    NoAction,
    /// G4 Px.
    Dwell,
    /// G10 L2/L20.
    SetCoordinateData,
    /// G28 / G28.1.
    GoHome0,
    SetHome0,
    /// G30 / G30.1.
    GoHome1,
    SetHome1,
    /// G53.
    AbsoluteOverride,
    /// G92 / G92.1.
    SetCoordinateOffset,
    ResetCoordinateOffset,
}

/// The complete modal state carried between blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub feed_rate_mode: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    /// Active work coordinate system, 0..=5 for G54..G59.
    pub coord_select: u8,
    pub program_flow: ProgramFlow,
    pub spindle: SpindleState,
    pub coolant: CoolantState,
}

/// Process-lifetime parser state. Reset on abort and on M2/M30.
#[derive(Debug, Clone, Default)]
pub struct ParserState {
    pub modal: ModalState,
    /// Active feed [mm/min].
    pub feed_rate: f32,
    /// Programmed spindle speed [RPM].
    pub spindle_speed: f32,
    /// Last T word.
    pub tool: u8,
    /// Last N word.
    pub line_number: u32,
    /// The parser's real-valued position shadow, machine coords [mm].
    pub position: [f32; N_AXIS],
    /// Active work-coordinate offsets, cached from the non-volatile store.
    pub coord_system: [f32; N_AXIS],
    /// G92 offset [mm].
    pub coord_offset: [f32; N_AXIS],
    /// G43.1 dynamic tool-length offset on the configured axis [mm].
    pub tool_length_offset: f32,
}

impl ParserState {
    /// Work-coordinate offset per axis: coord system + G92 + TLO.
    pub fn work_offset(&self, axis: usize) -> f32 {
        let mut offset = self.coord_system[axis] + self.coord_offset[axis];
        if axis == TOOL_LENGTH_OFFSET_AXIS {
            offset += self.tool_length_offset;
        }
        offset
    }
}

// ─── Block Scratch ──────────────────────────────────────────────────

bitflags! {
    /// Which value words appeared in the block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct ValueWords: u16 {
        const F = 1 << 0;
        const I = 1 << 1;
        const J = 1 << 2;
        const K = 1 << 3;
        const L = 1 << 4;
        const N = 1 << 5;
        const P = 1 << 6;
        const R = 1 << 7;
        const S = 1 << 8;
        const T = 1 << 9;
        const X = 1 << 10;
        const Y = 1 << 11;
        const Z = 1 << 12;
    }
}

bitflags! {
    /// Which modal groups were assigned in the block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct CommandGroups: u16 {
        const NON_MODAL    = 1 << 0;
        const MOTION       = 1 << 1;
        const PLANE        = 1 << 2;
        const DISTANCE     = 1 << 3;
        const UNITS        = 1 << 4;
        const FEED_RATE    = 1 << 5;
        const COORD_SYSTEM = 1 << 6;
        const PATH_CONTROL = 1 << 7;
        const TOOL_LENGTH  = 1 << 8;
        const PROGRAM_FLOW = 1 << 9;
        const COOLANT      = 1 << 10;
        const SPINDLE      = 1 << 11;
    }
}

/// Which command claimed the block's axis words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AxisCommand {
    #[default]
    None,
    NonModal,
    Motion,
    ToolLength,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockValues {
    f: f32,
    ijk: [f32; N_AXIS],
    l: u8,
    n: f32,
    p: f32,
    r: f32,
    s: f32,
    t: u8,
    xyz: [f32; N_AXIS],
}

/// Scratch block: modal copy plus this line's words.
#[derive(Debug, Clone, Copy, Default)]
struct ParsedBlock {
    modal: ModalState,
    non_modal: NonModal,
    values: BlockValues,
    words: ValueWords,
    groups: CommandGroups,
    /// One-bit-per-axis: which of X/Y/Z appeared.
    axis_words: u8,
    /// One-bit-per-axis: which of I/J/K appeared.
    ijk_words: u8,
    axis_command: AxisCommand,
}

impl ParsedBlock {
    fn claim_axis_words(&mut self, claimant: AxisCommand) -> Result<(), Status> {
        if self.axis_command != AxisCommand::None {
            return Err(Status::AxisCommandConflict);
        }
        self.axis_command = claimant;
        Ok(())
    }

    fn add_group(&mut self, group: CommandGroups) -> Result<(), Status> {
        if self.groups.intersects(group) {
            return Err(Status::ModalGroupViolation);
        }
        self.groups.insert(group);
        Ok(())
    }

    fn add_word(&mut self, word: ValueWords) -> Result<(), Status> {
        if self.words.intersects(word) {
            return Err(Status::WordRepeated);
        }
        self.words.insert(word);
        Ok(())
    }
}

/// Arc geometry resolved during validation.
#[derive(Debug, Clone, Copy)]
struct ArcData {
    /// Centre offset from the start point, plane axes [mm].
    offset: [f32; 2],
    /// Arc radius [mm].
    radius: f32,
    is_clockwise: bool,
}

/// How to reconcile the position shadow after the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcUpdatePos {
    /// Ordinary motion: shadow becomes the computed target.
    Target,
    /// Probe/homing: shadow re-read from the authoritative step count.
    System,
    /// Failed probe contact: leave for the alarm path to reconcile.
    None,
}

// ─── Number Scanning ────────────────────────────────────────────────

/// Read a signed float at `*idx`, advancing past it.
fn read_float(bytes: &[u8], idx: &mut usize) -> Result<f32, Status> {
    let start = *idx;
    let mut end = start;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let mut digits = 0;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        if bytes[end].is_ascii_digit() {
            digits += 1;
        }
        end += 1;
    }
    if digits == 0 {
        return Err(Status::BadNumberFormat);
    }
    let text = core::str::from_utf8(&bytes[start..end]).map_err(|_| Status::BadNumberFormat)?;
    let value: f32 = text.parse().map_err(|_| Status::BadNumberFormat)?;
    *idx = end;
    Ok(value)
}

/// Split a G/M command number into integer part and two-digit mantissa,
/// e.g. 38.2 → (38, 20).
fn split_command(value: f32) -> (u16, u8) {
    let int_value = value.trunc();
    let mantissa = ((value - int_value) * 100.0).round() as u8;
    (int_value as u16, mantissa)
}

// ─── Phases 1 + 2: Initialise and Ingest ────────────────────────────

fn parse_words(line: &str, modal: &ModalState, jog: bool) -> Result<ParsedBlock, Status> {
    let bytes = line.as_bytes();
    let mut block = ParsedBlock {
        modal: *modal,
        ..ParsedBlock::default()
    };
    if jog {
        // `$J=` prefix: linear units-per-minute motion for this block only.
        block.modal.motion = MotionMode::Linear;
        block.modal.feed_rate_mode = FeedRateMode::UnitsPerMin;
    }
    let mut idx = if jog { 3 } else { 0 };

    while idx < bytes.len() {
        let letter = bytes[idx];
        if !letter.is_ascii_alphabetic() {
            return Err(Status::ExpectedCommandLetter);
        }
        idx += 1;
        let value = read_float(bytes, &mut idx)?;

        match letter {
            b'G' => ingest_g(&mut block, value)?,
            b'M' => ingest_m(&mut block, value)?,
            _ => ingest_value_word(&mut block, letter, value)?,
        }
    }
    Ok(block)
}

fn ingest_g(block: &mut ParsedBlock, value: f32) -> Result<(), Status> {
    if value < 0.0 {
        return Err(Status::UnsupportedCommand);
    }
    let (int_value, mantissa) = split_command(value);
    match (int_value, mantissa) {
        (0, 0) => {
            block.add_group(CommandGroups::MOTION)?;
            block.claim_axis_words(AxisCommand::Motion)?;
            block.modal.motion = MotionMode::Seek;
        }
        (1, 0) => {
            block.add_group(CommandGroups::MOTION)?;
            block.claim_axis_words(AxisCommand::Motion)?;
            block.modal.motion = MotionMode::Linear;
        }
        (2, 0) => {
            block.add_group(CommandGroups::MOTION)?;
            block.claim_axis_words(AxisCommand::Motion)?;
            block.modal.motion = MotionMode::CwArc;
        }
        (3, 0) => {
            block.add_group(CommandGroups::MOTION)?;
            block.claim_axis_words(AxisCommand::Motion)?;
            block.modal.motion = MotionMode::CcwArc;
        }
        (38, 20 | 30 | 40 | 50) => {
            block.add_group(CommandGroups::MOTION)?;
            block.claim_axis_words(AxisCommand::Motion)?;
            block.modal.motion = match mantissa {
                20 => MotionMode::ProbeToward,
                30 => MotionMode::ProbeTowardNoError,
                40 => MotionMode::ProbeAway,
                _ => MotionMode::ProbeAwayNoError,
            };
        }
        (80, 0) => {
            block.add_group(CommandGroups::MOTION)?;
            block.modal.motion = MotionMode::None;
        }
        (4, 0) => {
            block.add_group(CommandGroups::NON_MODAL)?;
            block.non_modal = NonModal::Dwell;
        }
        (10, 0) => {
            block.add_group(CommandGroups::NON_MODAL)?;
            block.claim_axis_words(AxisCommand::NonModal)?;
            block.non_modal = NonModal::SetCoordinateData;
        }
        (28, 0 | 10) | (30, 0 | 10) => {
            block.add_group(CommandGroups::NON_MODAL)?;
            block.non_modal = match (int_value, mantissa) {
                (28, 0) => {
                    block.claim_axis_words(AxisCommand::NonModal)?;
                    NonModal::GoHome0
                }
                (28, _) => NonModal::SetHome0,
                (30, 0) => {
                    block.claim_axis_words(AxisCommand::NonModal)?;
                    NonModal::GoHome1
                }
                _ => NonModal::SetHome1,
            };
        }
        (53, 0) => {
            block.add_group(CommandGroups::NON_MODAL)?;
            block.non_modal = NonModal::AbsoluteOverride;
        }
        (92, 0 | 10) => {
            block.add_group(CommandGroups::NON_MODAL)?;
            block.non_modal = if mantissa == 0 {
                block.claim_axis_words(AxisCommand::NonModal)?;
                NonModal::SetCoordinateOffset
            } else {
                NonModal::ResetCoordinateOffset
            };
        }
        (17, 0) => block.add_group(CommandGroups::PLANE)?,
        (18 | 19, 0) => return Err(Status::UnsupportedCommand),
        (90, 0) => {
            block.add_group(CommandGroups::DISTANCE)?;
            block.modal.distance = DistanceMode::Absolute;
        }
        (91, 0) => {
            block.add_group(CommandGroups::DISTANCE)?;
            block.modal.distance = DistanceMode::Incremental;
        }
        (20, 0) => {
            block.add_group(CommandGroups::UNITS)?;
            block.modal.units = UnitsMode::Inches;
        }
        (21, 0) => {
            block.add_group(CommandGroups::UNITS)?;
            block.modal.units = UnitsMode::Mm;
        }
        (93, 0) => {
            block.add_group(CommandGroups::FEED_RATE)?;
            block.modal.feed_rate_mode = FeedRateMode::InverseTime;
        }
        (94, 0) => {
            block.add_group(CommandGroups::FEED_RATE)?;
            block.modal.feed_rate_mode = FeedRateMode::UnitsPerMin;
        }
        (54..=59, 0) => {
            block.add_group(CommandGroups::COORD_SYSTEM)?;
            block.modal.coord_select = (int_value - 54) as u8;
        }
        (59, _) => return Err(Status::UnsupportedCoordSys),
        (61, 0) => block.add_group(CommandGroups::PATH_CONTROL)?,
        (40, 0) => {
            // Cutter compensation is permanently off; G40 is accepted as
            // a no-op so standard preambles pass.
        }
        (43, 10) => {
            block.add_group(CommandGroups::TOOL_LENGTH)?;
            block.claim_axis_words(AxisCommand::ToolLength)?;
        }
        (49, 0) => {
            block.add_group(CommandGroups::TOOL_LENGTH)?;
        }
        (_, 0) => return Err(Status::UnsupportedCommand),
        _ => return Err(Status::CommandValueNotInteger),
    }
    Ok(())
}

fn ingest_m(block: &mut ParsedBlock, value: f32) -> Result<(), Status> {
    if value < 0.0 {
        return Err(Status::UnsupportedCommand);
    }
    let (int_value, mantissa) = split_command(value);
    if mantissa != 0 {
        return Err(Status::CommandValueNotInteger);
    }
    match int_value {
        0 | 1 => {
            block.add_group(CommandGroups::PROGRAM_FLOW)?;
            block.modal.program_flow = ProgramFlow::Paused;
        }
        2 => {
            block.add_group(CommandGroups::PROGRAM_FLOW)?;
            block.modal.program_flow = ProgramFlow::CompletedM2;
        }
        30 => {
            block.add_group(CommandGroups::PROGRAM_FLOW)?;
            block.modal.program_flow = ProgramFlow::CompletedM30;
        }
        3 => {
            block.add_group(CommandGroups::SPINDLE)?;
            block.modal.spindle = SpindleState::Cw;
        }
        4 => {
            block.add_group(CommandGroups::SPINDLE)?;
            block.modal.spindle = SpindleState::Ccw;
        }
        5 => {
            block.add_group(CommandGroups::SPINDLE)?;
            block.modal.spindle = SpindleState::Disable;
        }
        7 => {
            block.add_group(CommandGroups::COOLANT)?;
            block.modal.coolant |= CoolantState::MIST;
        }
        8 => {
            block.add_group(CommandGroups::COOLANT)?;
            block.modal.coolant |= CoolantState::FLOOD;
        }
        9 => {
            block.add_group(CommandGroups::COOLANT)?;
            block.modal.coolant = CoolantState::empty();
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

fn ingest_value_word(block: &mut ParsedBlock, letter: u8, value: f32) -> Result<(), Status> {
    // Negative values are rejected up front for unsigned-by-nature words.
    if value < 0.0 && matches!(letter, b'F' | b'N' | b'P' | b'S' | b'T') {
        return Err(Status::NegativeValue);
    }
    match letter {
        b'F' => {
            block.add_word(ValueWords::F)?;
            block.values.f = value;
        }
        b'I' => {
            block.add_word(ValueWords::I)?;
            block.values.ijk[X_AXIS] = value;
            block.ijk_words |= 1 << X_AXIS;
        }
        b'J' => {
            block.add_word(ValueWords::J)?;
            block.values.ijk[Y_AXIS] = value;
            block.ijk_words |= 1 << Y_AXIS;
        }
        b'K' => {
            if N_AXIS < 3 {
                // No Z axis in this build: reject rather than drop.
                return Err(Status::UnsupportedCommand);
            }
            block.add_word(ValueWords::K)?;
            block.values.ijk[Z_AXIS] = value;
            block.ijk_words |= 1 << Z_AXIS;
        }
        b'L' => {
            block.add_word(ValueWords::L)?;
            if value.fract() != 0.0 {
                return Err(Status::CommandValueNotInteger);
            }
            block.values.l = value as u8;
        }
        b'N' => {
            block.add_word(ValueWords::N)?;
            block.values.n = value;
        }
        b'P' => {
            block.add_word(ValueWords::P)?;
            block.values.p = value;
        }
        b'R' => {
            block.add_word(ValueWords::R)?;
            block.values.r = value;
        }
        b'S' => {
            block.add_word(ValueWords::S)?;
            block.values.s = value;
        }
        b'T' => {
            block.add_word(ValueWords::T)?;
            if value.fract() != 0.0 {
                return Err(Status::CommandValueNotInteger);
            }
            block.values.t = value as u8;
        }
        b'X' => {
            block.add_word(ValueWords::X)?;
            block.values.xyz[X_AXIS] = value;
            block.axis_words |= 1 << X_AXIS;
        }
        b'Y' => {
            block.add_word(ValueWords::Y)?;
            block.values.xyz[Y_AXIS] = value;
            block.axis_words |= 1 << Y_AXIS;
        }
        b'Z' => {
            block.add_word(ValueWords::Z)?;
            block.values.xyz[Z_AXIS] = value;
            block.axis_words |= 1 << Z_AXIS;
        }
        _ => return Err(Status::UnsupportedCommand),
    }
    Ok(())
}

// ─── Phase 3 Result ─────────────────────────────────────────────────

/// A validated block, everything pre-computed and ready to enact.
struct CheckedBlock {
    block: ParsedBlock,
    /// Resolved feed for this block [mm/min, or 1/min inverse-time].
    feed_rate: f32,
    /// Motion target in machine coords [mm].
    target: [f32; N_AXIS],
    arc: Option<ArcData>,
    /// G10/G28.1/G30.1: slot and data to persist.
    coord_write: Option<(usize, [f32; N_AXIS])>,
    /// G28/G30: stored home position to travel to after the via-point.
    home_travel: Option<[f32; N_AXIS]>,
    /// New G92 offset to apply at commit.
    new_coord_offset: Option<[f32; N_AXIS]>,
    /// Coordinate table for a changed G54..G59 selection.
    new_coord_system: Option<[f32; N_AXIS]>,
    /// Has a motion to execute this block.
    has_motion: bool,
}

impl Machine {
    /// Execute one g-code (or `$J=` jog) line through all four phases.
    pub fn gc_execute_line(&mut self, line: &str) -> Result<(), Status> {
        let jog = line.starts_with("$J=");
        let block = parse_words(line, &self.gc.modal, jog)?;
        if jog {
            self.check_jog_block(&block)?;
        }
        let checked = self.check_block(block)?;
        if jog {
            self.commit_jog(checked)
        } else {
            self.commit_block(checked)
        }
    }

    /// Jog blocks admit only units, distance, and G53 words.
    fn check_jog_block(&self, block: &ParsedBlock) -> Result<(), Status> {
        let allowed =
            CommandGroups::UNITS | CommandGroups::DISTANCE | CommandGroups::NON_MODAL;
        if block.groups.intersects(!allowed) {
            return Err(Status::InvalidJogCommand);
        }
        if !matches!(
            block.non_modal,
            NonModal::NoAction | NonModal::AbsoluteOverride
        ) {
            return Err(Status::InvalidJogCommand);
        }
        if block.words.contains(ValueWords::N) {
            return Err(Status::InvalidJogCommand);
        }
        if !block.words.contains(ValueWords::F) {
            return Err(Status::UndefinedFeedRate);
        }
        if block.axis_words == 0 {
            return Err(Status::NoAxisWords);
        }
        Ok(())
    }

    /// Phase 3: validate in NIST order-of-execution and pre-compute the
    /// target, arc geometry, and coordinate data. Read-only on `gc`.
    fn check_block(&mut self, mut block: ParsedBlock) -> Result<CheckedBlock, Status> {
        let mut unused = block.words;
        let inches = block.modal.units == UnitsMode::Inches;
        let unit_scale = if inches { MM_PER_INCH } else { 1.0 };

        // Line number.
        if block.words.contains(ValueWords::N) {
            if block.values.n.fract() != 0.0 || block.values.n > MAX_LINE_NUMBER as f32 {
                return Err(Status::InvalidLineNumber);
            }
        }

        // Implicit motion: axis words with no claimant fall to the modal
        // motion mode, unless an axis-using non-modal is present.
        if block.axis_words != 0 && block.axis_command == AxisCommand::None {
            if block.modal.motion == MotionMode::None {
                return Err(Status::AxisWordsNoCommand);
            }
            block.axis_command = AxisCommand::Motion;
        }

        // Feed rate resolution.
        let feed_motion = matches!(
            block.modal.motion,
            MotionMode::Linear
                | MotionMode::CwArc
                | MotionMode::CcwArc
                | MotionMode::ProbeToward
                | MotionMode::ProbeTowardNoError
                | MotionMode::ProbeAway
                | MotionMode::ProbeAwayNoError
        );
        let feed_rate = match block.modal.feed_rate_mode {
            FeedRateMode::InverseTime => {
                // G93 requires a fresh F on every feed-motion block.
                if block.axis_command == AxisCommand::Motion && feed_motion {
                    if !block.words.contains(ValueWords::F) {
                        return Err(Status::UndefinedFeedRate);
                    }
                }
                block.values.f
            }
            FeedRateMode::UnitsPerMin => {
                if block.words.contains(ValueWords::F) {
                    block.values.f * unit_scale
                } else if self.gc.modal.feed_rate_mode == FeedRateMode::UnitsPerMin {
                    self.gc.feed_rate
                } else {
                    // Mode switch without a fresh F: feed is undefined.
                    0.0
                }
            }
        };
        if block.axis_command == AxisCommand::Motion && feed_motion && feed_rate == 0.0 {
            return Err(Status::UndefinedFeedRate);
        }

        // Coordinate system select (G54..G59): fetch the table now so a
        // store failure aborts before any state mutation.
        let mut new_coord_system = None;
        if block.groups.contains(CommandGroups::COORD_SYSTEM)
            && block.modal.coord_select != self.gc.modal.coord_select
        {
            let data = nvs::load_coord_data(
                self.nvs.as_mut(),
                block.modal.coord_select as usize,
            )
            .map_err(|_| Status::SettingReadFail)?;
            new_coord_system = Some(data);
        }

        // Tool length offset.
        if block.groups.contains(CommandGroups::TOOL_LENGTH)
            && block.axis_command == AxisCommand::ToolLength
        {
            // G43.1: exactly the offset axis word, nothing else.
            if block.axis_words != (1 << TOOL_LENGTH_OFFSET_AXIS) {
                return Err(Status::G43DynamicAxisError);
            }
            unused.remove(ValueWords::X | ValueWords::Y | ValueWords::Z);
        }

        // Non-modal pre-computation.
        let mut coord_write = None;
        let mut home_travel = None;
        let mut new_coord_offset = None;
        match block.non_modal {
            NonModal::Dwell => {
                if !block.words.contains(ValueWords::P) {
                    return Err(Status::ValueWordMissing);
                }
                unused.remove(ValueWords::P);
            }
            NonModal::SetCoordinateData => {
                if !block.words.contains(ValueWords::P) || !block.words.contains(ValueWords::L) {
                    return Err(Status::ValueWordMissing);
                }
                if block.values.p.fract() != 0.0 || block.values.p < 0.0 {
                    return Err(Status::CommandValueNotInteger);
                }
                let p = block.values.p as usize;
                if p > 6 {
                    return Err(Status::UnsupportedCoordSys);
                }
                // P0 addresses the active system.
                let slot = if p == 0 {
                    self.gc.modal.coord_select as usize
                } else {
                    p - 1
                };
                let current = nvs::load_coord_data(self.nvs.as_mut(), slot)
                    .map_err(|_| Status::SettingReadFail)?;
                let mut data = current;
                match block.values.l {
                    2 => {
                        if block.words.contains(ValueWords::R) {
                            return Err(Status::UnsupportedCommand);
                        }
                        for axis in 0..N_AXIS {
                            if block.axis_words & (1 << axis) != 0 {
                                data[axis] = block.values.xyz[axis] * unit_scale;
                            }
                        }
                    }
                    20 => {
                        // Set the table so the current position reads as
                        // the given value.
                        for axis in 0..N_AXIS {
                            if block.axis_words & (1 << axis) != 0 {
                                let mut value = self.gc.position[axis]
                                    - self.gc.coord_offset[axis]
                                    - block.values.xyz[axis] * unit_scale;
                                if axis == TOOL_LENGTH_OFFSET_AXIS {
                                    value -= self.gc.tool_length_offset;
                                }
                                data[axis] = value;
                            }
                        }
                    }
                    _ => return Err(Status::UnsupportedCommand),
                }
                coord_write = Some((slot, data));
                unused.remove(ValueWords::P | ValueWords::L);
            }
            NonModal::GoHome0 | NonModal::GoHome1 => {
                let slot = if block.non_modal == NonModal::GoHome0 {
                    COORD_G28
                } else {
                    COORD_G30
                };
                let home = nvs::load_coord_data(self.nvs.as_mut(), slot)
                    .map_err(|_| Status::SettingReadFail)?;
                home_travel = Some(home);
            }
            NonModal::SetHome0 => {
                coord_write = Some((COORD_G28, self.gc.position));
            }
            NonModal::SetHome1 => {
                coord_write = Some((COORD_G30, self.gc.position));
            }
            NonModal::AbsoluteOverride => {
                // G53 rides on this block's G0/G1 only.
                if !matches!(block.modal.motion, MotionMode::Seek | MotionMode::Linear) {
                    return Err(Status::G53InvalidMotionMode);
                }
            }
            NonModal::SetCoordinateOffset => {
                if block.axis_words == 0 {
                    return Err(Status::NoAxisWords);
                }
                let mut offset = self.gc.coord_offset;
                for axis in 0..N_AXIS {
                    if block.axis_words & (1 << axis) != 0 {
                        let mut value = self.gc.position[axis]
                            - self.gc.coord_system[axis]
                            - block.values.xyz[axis] * unit_scale;
                        if axis == TOOL_LENGTH_OFFSET_AXIS {
                            value -= self.gc.tool_length_offset;
                        }
                        offset[axis] = value;
                    }
                }
                new_coord_offset = Some(offset);
            }
            NonModal::ResetCoordinateOffset => {
                new_coord_offset = Some([0.0; N_AXIS]);
            }
            NonModal::NoAction => {}
        }

        // Target computation for any command that moves or stores axes.
        let mut target = self.gc.position;
        if block.axis_command != AxisCommand::None
            && block.axis_command != AxisCommand::ToolLength
        {
            let absolute_override = block.non_modal == NonModal::AbsoluteOverride;
            let coord_system = new_coord_system.unwrap_or(self.gc.coord_system);
            for axis in 0..N_AXIS {
                if block.axis_words & (1 << axis) == 0 {
                    continue;
                }
                let value = block.values.xyz[axis] * unit_scale;
                target[axis] = if absolute_override {
                    value
                } else {
                    match block.modal.distance {
                        DistanceMode::Absolute => {
                            let mut t = value + coord_system[axis] + self.gc.coord_offset[axis];
                            if axis == TOOL_LENGTH_OFFSET_AXIS {
                                t += self.gc.tool_length_offset;
                            }
                            t
                        }
                        DistanceMode::Incremental => self.gc.position[axis] + value,
                    }
                };
            }
            unused.remove(ValueWords::X | ValueWords::Y | ValueWords::Z);
        }

        // Motion-mode validation and arc pre-computation.
        let mut arc = None;
        let mut has_motion = false;
        if block.axis_command == AxisCommand::Motion {
            match block.modal.motion {
                MotionMode::None => {}
                MotionMode::Seek | MotionMode::Linear => {
                    if block.axis_words == 0 {
                        return Err(Status::NoAxisWords);
                    }
                    has_motion = true;
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    let plane_bits = (1 << X_AXIS) | (1 << Y_AXIS);
                    if block.axis_words & plane_bits == 0 {
                        return Err(Status::NoAxisWordsInPlane);
                    }
                    let is_clockwise = block.modal.motion == MotionMode::CwArc;
                    arc = Some(self.check_arc(&block, &target, unit_scale, is_clockwise)?);
                    unused.remove(ValueWords::I | ValueWords::J | ValueWords::R);
                    has_motion = true;
                }
                _ => {
                    // Probe motions: need axis words and a real move.
                    if block.axis_words == 0 {
                        return Err(Status::NoAxisWords);
                    }
                    if target == self.gc.position {
                        return Err(Status::InvalidTarget);
                    }
                    has_motion = true;
                }
            }
        } else if block.groups.contains(CommandGroups::MOTION)
            && block.modal.motion != MotionMode::None
        {
            // Explicit motion command with its axis words taken elsewhere
            // or absent entirely.
            return Err(Status::NoAxisWords);
        }

        // Single-meaning words are consumed by state updates.
        unused.remove(ValueWords::N | ValueWords::F | ValueWords::S | ValueWords::T);
        if !unused.is_empty() {
            return Err(Status::UnusedWords);
        }

        Ok(CheckedBlock {
            block,
            feed_rate,
            target,
            arc,
            coord_write,
            home_travel,
            new_coord_offset,
            new_coord_system,
            has_motion,
        })
    }

    /// Radius- and offset-form arc geometry, per the perpendicular-offset
    /// construction and the centre-disagreement tolerances.
    fn check_arc(
        &self,
        block: &ParsedBlock,
        target: &[f32; N_AXIS],
        unit_scale: f32,
        is_clockwise: bool,
    ) -> Result<ArcData, Status> {
        let x = target[X_AXIS] - self.gc.position[X_AXIS];
        let y = target[Y_AXIS] - self.gc.position[Y_AXIS];

        if block.words.contains(ValueWords::R) {
            if block.ijk_words != 0 {
                // Mixed forms never make sense; offsets would go unused.
                return Err(Status::UnusedWords);
            }
            if x == 0.0 && y == 0.0 {
                return Err(Status::InvalidTarget);
            }
            let mut r = block.values.r * unit_scale;
            let mut h_x2_div_d = 4.0 * r * r - x * x - y * y;
            if h_x2_div_d < 0.0 {
                return Err(Status::ArcRadiusError);
            }
            h_x2_div_d = -h_x2_div_d.sqrt() / (x * x + y * y).sqrt();
            if !is_clockwise {
                h_x2_div_d = -h_x2_div_d;
            }
            if r < 0.0 {
                // Negative R selects the long way around.
                h_x2_div_d = -h_x2_div_d;
                r = -r;
            }
            Ok(ArcData {
                offset: [
                    0.5 * (x - y * h_x2_div_d),
                    0.5 * (y + x * h_x2_div_d),
                ],
                radius: r,
                is_clockwise,
            })
        } else {
            if block.ijk_words & ((1 << X_AXIS) | (1 << Y_AXIS)) == 0 {
                return Err(Status::NoOffsetsInPlane);
            }
            let i = block.values.ijk[X_AXIS] * unit_scale;
            let j = block.values.ijk[Y_AXIS] * unit_scale;
            let radius = (i * i + j * j).sqrt();
            let target_r = {
                let dx = x - i;
                let dy = y - j;
                (dx * dx + dy * dy).sqrt()
            };
            // Centre disagreement: hard 0.5 mm cap, then 0.1% of radius
            // once beyond measurement noise.
            let delta_r = (target_r - radius).abs();
            if delta_r > 0.005 {
                if delta_r > 0.5 {
                    return Err(Status::InvalidTarget);
                }
                if delta_r > 0.001 * radius {
                    return Err(Status::InvalidTarget);
                }
            }
            Ok(ArcData {
                offset: [i, j],
                radius,
                is_clockwise,
            })
        }
    }

    // ─── Phase 4: Commit ────────────────────────────────────────────

    fn commit_block(&mut self, checked: CheckedBlock) -> Result<(), Status> {
        let block = checked.block;

        // Modal and scalar state, in order of execution.
        self.gc.modal.feed_rate_mode = block.modal.feed_rate_mode;
        self.gc.feed_rate = checked.feed_rate;
        if block.words.contains(ValueWords::S) {
            self.gc.spindle_speed = block.values.s;
        }
        if block.words.contains(ValueWords::T) {
            self.gc.tool = block.values.t;
        }
        if block.words.contains(ValueWords::N) {
            self.gc.line_number = block.values.n as u32;
        }
        self.gc.modal.spindle = block.modal.spindle;
        self.gc.modal.coolant = block.modal.coolant;

        // Dwell runs before anything position-related.
        if block.non_modal == NonModal::Dwell {
            self.mc_dwell(block.values.p);
        }

        self.gc.modal.units = block.modal.units;

        if block.groups.contains(CommandGroups::TOOL_LENGTH) {
            // A tool-offset change moves the reported work position: keep
            // it consistent with what has actually executed.
            self.buffer_synchronize();
            if block.axis_command == AxisCommand::ToolLength {
                let scale = if block.modal.units == UnitsMode::Inches {
                    MM_PER_INCH
                } else {
                    1.0
                };
                self.gc.tool_length_offset =
                    block.values.xyz[TOOL_LENGTH_OFFSET_AXIS] * scale;
            } else {
                // G49.
                self.gc.tool_length_offset = 0.0;
            }
        }

        // Work-coordinate selection: drain motion first so reported work
        // position stays consistent with execution.
        if let Some(coord_system) = checked.new_coord_system {
            self.buffer_synchronize();
            self.gc.modal.coord_select = block.modal.coord_select;
            self.gc.coord_system = coord_system;
        }

        self.gc.modal.distance = block.modal.distance;

        // Non-modal actions.
        match block.non_modal {
            NonModal::SetCoordinateData | NonModal::SetHome0 | NonModal::SetHome1 => {
                let (slot, data) = checked.coord_write.expect("validated in phase 3");
                // Non-volatile writes stall interrupts: drain motion first.
                self.buffer_synchronize();
                if self.check_mode() {
                    // Dry run: validated but never persisted.
                } else {
                    nvs::store_coord_data(self.nvs.as_mut(), slot, &data)
                        .map_err(|_| Status::SettingReadFail)?;
                    if block.non_modal == NonModal::SetCoordinateData
                        && slot == self.gc.modal.coord_select as usize
                    {
                        self.gc.coord_system = data;
                    }
                }
            }
            NonModal::GoHome0 | NonModal::GoHome1 => {
                let pl_data = PlanLineData {
                    feed_rate: 0.0,
                    spindle_rpm: self.gc.spindle_speed,
                    condition: Condition::RAPID_MOTION,
                    line_number: self.gc.line_number,
                };
                if block.axis_words != 0 {
                    // Via-point move with the block's axis words.
                    self.mc_line(&checked.target, &pl_data)?;
                }
                let home = checked.home_travel.expect("validated in phase 3");
                self.mc_line(&home, &pl_data)?;
                if self.motion_update_pos() == GcUpdatePos::Target {
                    self.gc.position = home;
                }
            }
            NonModal::SetCoordinateOffset | NonModal::ResetCoordinateOffset => {
                self.buffer_synchronize();
                self.gc.coord_offset =
                    checked.new_coord_offset.expect("validated in phase 3");
            }
            _ => {}
        }

        // Motion.
        if checked.has_motion {
            self.gc.modal.motion = block.modal.motion;
            let update = self.execute_motion(&block, &checked)?;
            match update {
                GcUpdatePos::Target => self.gc.position = checked.target,
                GcUpdatePos::System => self.gc.position = self.machine_position_mm(),
                GcUpdatePos::None => {}
            }
        } else if block.groups.contains(CommandGroups::MOTION) {
            self.gc.modal.motion = block.modal.motion;
        }

        // Program flow.
        self.gc.modal.program_flow = block.modal.program_flow;
        match block.modal.program_flow {
            ProgramFlow::Running => {}
            ProgramFlow::Paused => {
                self.buffer_synchronize();
                self.program_pause();
            }
            ProgramFlow::CompletedM2 | ProgramFlow::CompletedM30 => {
                self.buffer_synchronize();
                self.program_end();
            }
        }
        Ok(())
    }

    fn execute_motion(
        &mut self,
        block: &ParsedBlock,
        checked: &CheckedBlock,
    ) -> Result<GcUpdatePos, Status> {
        let mut pl_data = PlanLineData {
            feed_rate: checked.feed_rate,
            spindle_rpm: self.gc.spindle_speed,
            condition: Condition::empty(),
            line_number: self.gc.line_number,
        };
        if block.modal.feed_rate_mode == FeedRateMode::InverseTime {
            pl_data.condition |= Condition::INVERSE_TIME;
        }

        match block.modal.motion {
            MotionMode::Seek => {
                pl_data.condition |= Condition::RAPID_MOTION;
                self.mc_line(&checked.target, &pl_data)?;
                Ok(self.motion_update_pos())
            }
            MotionMode::Linear => {
                self.mc_line(&checked.target, &pl_data)?;
                Ok(self.motion_update_pos())
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                let arc = checked.arc.expect("validated in phase 3");
                self.mc_arc(
                    &checked.target,
                    &pl_data,
                    arc.offset,
                    arc.radius,
                    arc.is_clockwise,
                )?;
                Ok(self.motion_update_pos())
            }
            MotionMode::ProbeToward
            | MotionMode::ProbeTowardNoError
            | MotionMode::ProbeAway
            | MotionMode::ProbeAwayNoError => {
                let away = matches!(
                    block.modal.motion,
                    MotionMode::ProbeAway | MotionMode::ProbeAwayNoError
                );
                let no_error = matches!(
                    block.modal.motion,
                    MotionMode::ProbeTowardNoError | MotionMode::ProbeAwayNoError
                );
                self.mc_probe_cycle(&checked.target, &pl_data, away, no_error)
            }
            MotionMode::None => Ok(GcUpdatePos::Target),
        }
    }

    /// A motion that was refused (soft-limit alarm, abort) must not move
    /// the position shadow.
    fn motion_update_pos(&self) -> GcUpdatePos {
        if self.abort || self.state == carve_common::state::MachineState::Alarm {
            GcUpdatePos::None
        } else {
            GcUpdatePos::Target
        }
    }

    /// Jog commit: plan the motion, advance the shadow, leave every modal
    /// untouched.
    fn commit_jog(&mut self, checked: CheckedBlock) -> Result<(), Status> {
        if !checked.has_motion {
            return Err(Status::InvalidJogCommand);
        }
        self.jog_execute(&checked.target, checked.feed_rate)?;
        self.gc.position = checked.target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn machine() -> Machine {
        Machine::for_tests()
    }

    fn exec(machine: &mut Machine, line: &str) -> Result<(), Status> {
        machine.gc_execute_line(line)
    }

    // ── Word ingest ──

    #[test]
    fn unknown_letter_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "A10"), Err(Status::UnsupportedCommand));
    }

    #[test]
    fn missing_number_is_bad_format() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "GX1"), Err(Status::BadNumberFormat));
    }

    #[test]
    fn leading_digit_expects_letter() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "1G0"), Err(Status::ExpectedCommandLetter));
    }

    #[test]
    fn repeated_word_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G1X5X6F100"), Err(Status::WordRepeated));
    }

    #[test]
    fn modal_group_violation_two_motions() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G0G1X5"), Err(Status::ModalGroupViolation));
    }

    #[test]
    fn negative_feed_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G1X5F-100"), Err(Status::NegativeValue));
    }

    #[test]
    fn fractional_g_commands_whitelisted_only() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G38.9X1F100"), Err(Status::CommandValueNotInteger));
        assert_eq!(exec(&mut m, "G1.5X1F100"), Err(Status::CommandValueNotInteger));
    }

    #[test]
    fn fractional_m_command_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "M3.5"), Err(Status::CommandValueNotInteger));
    }

    #[test]
    fn unsupported_plane_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G18"), Err(Status::UnsupportedCommand));
        assert_eq!(exec(&mut m, "G19"), Err(Status::UnsupportedCommand));
    }

    // ── Validation ──

    #[test]
    fn line_number_bounds() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "N10000000G0X1"), Ok(()));
        assert_eq!(
            exec(&mut m, "N10000001G0X2"),
            Err(Status::InvalidLineNumber)
        );
        assert_eq!(exec(&mut m, "N1.5G0X2"), Err(Status::InvalidLineNumber));
    }

    #[test]
    fn feed_motion_without_feed_rate_fails() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G1X5"), Err(Status::UndefinedFeedRate));
        // Rapid motion needs no feed.
        assert_eq!(exec(&mut m, "G0X5"), Ok(()));
    }

    #[test]
    fn feed_rate_is_modal() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G1X5F300"), Ok(()));
        assert_eq!(exec(&mut m, "G1X6"), Ok(()));
        assert_eq!(m.gc.feed_rate, 300.0);
    }

    #[test]
    fn inverse_time_requires_fresh_feed() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G93G1X5F2"), Ok(()));
        assert_eq!(exec(&mut m, "G1X6"), Err(Status::UndefinedFeedRate));
    }

    #[test]
    fn axis_words_without_usable_command() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G80X5"), Err(Status::AxisWordsNoCommand));
        // Dwell does not claim axis words, so the modal motion mode is
        // implicit and the block both dwells and moves.
        assert_eq!(exec(&mut m, "G4P0.05X5"), Ok(()));
        assert_eq!(m.gc.position[X_AXIS], 5.0);
    }

    #[test]
    fn dwell_requires_p() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G4"), Err(Status::ValueWordMissing));
        assert_eq!(exec(&mut m, "G4P0.1"), Ok(()));
    }

    #[test]
    fn unused_words_rejected() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G0X1R5"), Err(Status::UnusedWords));
        assert_eq!(exec(&mut m, "G4P0.1L2"), Err(Status::UnusedWords));
    }

    #[test]
    fn g53_requires_linear_or_seek() {
        let mut m = machine();
        assert_eq!(
            exec(&mut m, "G53G2X1Y1I1F100"),
            Err(Status::G53InvalidMotionMode)
        );
        assert_eq!(exec(&mut m, "G53G0X-1"), Ok(()));
        // G53 applied to this block only: machine coords directly.
        assert_eq!(m.gc.position[X_AXIS], -1.0);
    }

    #[test]
    fn g10_policy() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G10X1"), Err(Status::ValueWordMissing));
        assert_eq!(exec(&mut m, "G10L2P7X1"), Err(Status::UnsupportedCoordSys));
        assert_eq!(exec(&mut m, "G10L3P1X1"), Err(Status::UnsupportedCommand));
        assert_eq!(exec(&mut m, "G10L2P1R2X1"), Err(Status::UnsupportedCommand));
        assert_eq!(exec(&mut m, "G10L2P1X5Y6Z7"), Ok(()));
    }

    #[test]
    fn g10_l2_then_select_applies_offsets() {
        let mut m = machine();
        exec(&mut m, "G10L2P2X5Y6Z7").unwrap();
        exec(&mut m, "G55").unwrap();
        assert_eq!(m.gc.coord_system, [5.0, 6.0, 7.0]);
        // Work-coordinate round trip: absolute X0 lands at machine 5.
        exec(&mut m, "G0X0Y0Z0").unwrap();
        assert_eq!(m.gc.position, [5.0, 6.0, 7.0]);
    }

    #[test]
    fn g92_offsets_then_clear() {
        let mut m = machine();
        exec(&mut m, "G0X10").unwrap();
        exec(&mut m, "G92X0").unwrap();
        assert_eq!(m.gc.coord_offset[X_AXIS], 10.0);
        // Absolute X5 is machine 15 under the offset.
        exec(&mut m, "G0X5").unwrap();
        assert_eq!(m.gc.position[X_AXIS], 15.0);
        exec(&mut m, "G92.1").unwrap();
        assert_eq!(m.gc.coord_offset, [0.0; N_AXIS]);
    }

    #[test]
    fn g92_requires_axis_words() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G92"), Err(Status::NoAxisWords));
    }

    #[test]
    fn distance_modes_compose() {
        let mut m = machine();
        exec(&mut m, "G90G0X10").unwrap();
        exec(&mut m, "G91G0X0").unwrap();
        // G90 X10 then incremental X0 must stay at 10.
        assert_eq!(m.gc.position[X_AXIS], 10.0);
        exec(&mut m, "G0X2.5").unwrap();
        assert_eq!(m.gc.position[X_AXIS], 12.5);
    }

    #[test]
    fn inch_units_scale_axis_words() {
        let mut m = machine();
        exec(&mut m, "G20G0X1").unwrap();
        assert!((m.gc.position[X_AXIS] - 25.4).abs() < 1e-4);
        exec(&mut m, "G21G90G0X1").unwrap();
        assert!((m.gc.position[X_AXIS] - 1.0).abs() < 1e-4);
    }

    // ── Arcs ──

    #[test]
    fn arc_requires_plane_words_and_offsets() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G2Z1F100"), Err(Status::NoAxisWordsInPlane));
        assert_eq!(exec(&mut m, "G2X1Y1F100"), Err(Status::NoOffsetsInPlane));
    }

    #[test]
    fn radius_arc_geometry_unsolvable() {
        let mut m = machine();
        // Chord of 10 with radius 1: no centre exists.
        assert_eq!(exec(&mut m, "G2X10Y0R1F100"), Err(Status::ArcRadiusError));
    }

    #[test]
    fn radius_arc_identical_endpoints_invalid() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G2X0Y0R5F100"), Err(Status::InvalidTarget));
    }

    #[test]
    fn offset_arc_centre_disagreement() {
        let mut m = machine();
        // Centre at (5,0): start radius 5, target radius wildly off.
        assert_eq!(exec(&mut m, "G2X30Y0I5J0F100"), Err(Status::InvalidTarget));
    }

    #[test]
    fn half_circle_executes() {
        let mut m = machine();
        assert_eq!(exec(&mut m, "G2X10Y0I5J0F300"), Ok(()));
        assert!((m.gc.position[X_AXIS] - 10.0).abs() < 1e-3);
        assert!(m.gc.position[Y_AXIS].abs() < 1e-3);
    }

    #[test]
    fn full_circle_via_identical_endpoints() {
        let mut m = machine();
        // Offset form with coincident start/end traces a full circle.
        assert_eq!(exec(&mut m, "G2X0Y0I5J0F300"), Ok(()));
        assert_eq!(m.gc.position[X_AXIS], 0.0);
        // The machine actually travelled: step pulses were emitted.
        assert!(m.steps_emitted()[X_AXIS] > 0);
    }

    // ── Failure atomicity ──

    #[test]
    fn failing_block_leaves_state_untouched() {
        let mut m = machine();
        exec(&mut m, "G1X5F300").unwrap();
        let before_modal_motion = m.gc.modal.motion;
        let before_feed = m.gc.feed_rate;
        let before_pos = m.gc.position;

        assert!(exec(&mut m, "G93G2X6Y1R9F-5").is_err());
        assert_eq!(m.gc.modal.motion, before_modal_motion);
        assert_eq!(m.gc.feed_rate, before_feed);
        assert_eq!(m.gc.position, before_pos);
        assert_eq!(m.gc.modal.feed_rate_mode, FeedRateMode::UnitsPerMin);
    }

    // ── Program flow ──

    #[test]
    fn m2_resets_modals() {
        let mut m = machine();
        exec(&mut m, "G91G20G93M3S100").unwrap();
        exec(&mut m, "M2").unwrap();
        assert_eq!(m.gc.modal.motion, MotionMode::Linear);
        assert_eq!(m.gc.modal.distance, DistanceMode::Absolute);
        assert_eq!(m.gc.modal.feed_rate_mode, FeedRateMode::UnitsPerMin);
        assert_eq!(m.gc.modal.coord_select, 0);
        assert_eq!(m.gc.modal.spindle, SpindleState::Disable);
    }

    // ── Jog ──

    #[test]
    fn jog_rejects_foreign_groups() {
        let mut m = machine();
        assert_eq!(
            m.gc_execute_line("$J=G1X5F100"),
            Err(Status::InvalidJogCommand)
        );
        assert_eq!(
            m.gc_execute_line("$J=M3X5F100"),
            Err(Status::InvalidJogCommand)
        );
        assert_eq!(
            m.gc_execute_line("$J=G4P1X5F100"),
            Err(Status::InvalidJogCommand)
        );
    }

    #[test]
    fn jog_requires_feed_and_axis_words() {
        let mut m = machine();
        assert_eq!(m.gc_execute_line("$J=X5"), Err(Status::UndefinedFeedRate));
        assert_eq!(m.gc_execute_line("$J=F100"), Err(Status::NoAxisWords));
    }

    #[test]
    fn jog_bypasses_modal_state() {
        let mut m = machine();
        m.gc_execute_line("$J=G91X5F600").unwrap();
        // Distance mode G91 applied to the jog only.
        assert_eq!(m.gc.modal.distance, DistanceMode::Absolute);
        assert_eq!(m.gc.position[X_AXIS], 5.0);
    }
}
