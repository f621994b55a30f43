use std::fmt;
use std::iter::Iterator;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlotCarError};

/// Lower bound, upper bound and increment of one discretized axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Axis {
    pub lower: i32,
    pub upper: i32,
    pub step: i32,
}

impl Axis {
    pub fn new(lower: i32, upper: i32, step: i32) -> Axis {
        Axis { lower, upper, step }
    }

    fn validate(&self, name: &'static str) -> Result<()> {
        if self.lower >= self.upper {
            return Err(SlotCarError::ShapeInvalid {
                axis: name,
                reason: "lower bound must be below upper bound",
                value: i64::from(self.lower),
            });
        }
        if self.step <= 0 {
            return Err(SlotCarError::ShapeInvalid {
                axis: name,
                reason: "step must be > 0",
                value: i64::from(self.step),
            });
        }
        if i64::from(self.step) > self.span() {
            return Err(SlotCarError::ShapeInvalid {
                axis: name,
                reason: "step must not exceed upper - lower",
                value: i64::from(self.step),
            });
        }
        Ok(())
    }

    fn span(&self) -> i64 {
        i64::from(self.upper) - i64::from(self.lower)
    }

    /// Number of grid points on the axis: floor((upper - lower) / step) + 1.
    pub fn cardinality(&self) -> usize {
        (self.span() / i64::from(self.step)) as usize + 1
    }

    fn checked_cardinality(&self, name: &'static str) -> Result<usize> {
        let count = self.span() / i64::from(self.step) + 1;
        usize::try_from(count).map_err(|_| SlotCarError::ShapeInvalid {
            axis: name,
            reason: "too many grid points",
            value: count,
        })
    }

    pub fn contains(&self, value: i32) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Grid position of a value already known to be inside the bounds.
    fn digit(&self, value: i32) -> usize {
        ((i64::from(value) - i64::from(self.lower)) / i64::from(self.step)) as usize
    }

    fn value_at(&self, digit: usize) -> i32 {
        (i64::from(self.lower) + digit as i64 * i64::from(self.step)) as i32
    }

    /// Truncates a raw measurement toward zero and clamps it into the bounds.
    /// NaN maps to 0 before clamping.
    fn clamp(&self, raw: f64) -> i32 {
        (raw.trunc() as i32).clamp(self.lower, self.upper)
    }
}

/// State discretization as read from configuration: one entry per axis,
/// ordered severity, distance, speed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StateShape {
    pub lower: [i32; 3],
    pub upper: [i32; 3],
    pub step: [i32; 3],
}

impl StateShape {
    fn axes(&self) -> [Axis; 3] {
        [0, 1, 2].map(|i| Axis::new(self.lower[i], self.upper[i], self.step[i]))
    }
}

impl Default for StateShape {
    fn default() -> Self {
        StateShape {
            lower: [0, 0, 0],
            upper: [1, 99, 999],
            step: [1, 30, 100],
        }
    }
}

/// Commanded throttle discretization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionShape {
    pub lower: i32,
    pub upper: i32,
    pub step: i32,
}

impl Default for ActionShape {
    fn default() -> Self {
        ActionShape { lower: 30, upper: 90, step: 2 }
    }
}

const STATE_AXIS_NAMES: [&str; 3] = ["severity", "distance", "speed"];

/// Inclusive value range of each state axis that fits its digits in the 6 digit label.
const STATE_LABEL_RANGES: [(i32, i32); 3] = [(0, 9), (0, 99), (0, 999)];

/// Largest table the encoder will index (actions x states).
pub const MAX_TABLE_ENTRIES: usize = 1 << 26;

/// The car's situation at a decision point.
///
/// Labels are 6 digits wide for every state of a valid shape: `SpaceEncoder::new` rejects
/// shapes with negative bounds or bounds wider than their digits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct State {
    /// 0 when the next feature is a straight, 1 for a turn
    pub severity: i32,
    /// Distance to the next feature (cm)
    pub distance: i32,
    /// Car speed (cm/s)
    pub speed: i32,
}

impl State {
    pub fn new(severity: i32, distance: i32, speed: i32) -> State {
        State { severity, distance, speed }
    }

    fn values(&self) -> [i32; 3] {
        [self.severity, self.distance, self.speed]
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{:02}{:03}", self.severity, self.distance, self.speed)
    }
}

impl FromStr for State {
    type Err = SlotCarError;

    /// Parses the 6 digit label: 1 digit severity, 2 digits distance, 3 digits speed.
    fn from_str(label: &str) -> Result<State> {
        if label.len() != 6 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SlotCarError::LabelInvalid(label.to_string()));
        }
        let field = |range: std::ops::Range<usize>| -> Result<i32> {
            label[range]
                .parse()
                .map_err(|_| SlotCarError::LabelInvalid(label.to_string()))
        };
        Ok(State::new(field(0..1)?, field(1..3)?, field(3..6)?))
    }
}

/// A commanded throttle value.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Action(pub i32);

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Action {
    type Err = SlotCarError;

    fn from_str(label: &str) -> Result<Action> {
        label
            .trim()
            .parse()
            .map(Action)
            .map_err(|_| SlotCarError::LabelInvalid(label.to_string()))
    }
}

/// Constant-time mapping between states/actions and table indices.
///
/// States are treated as mixed-radix numbers, severity most significant, then distance,
/// then speed. Values between grid points fall into the bucket of the grid point below them.
#[derive(Debug, Clone)]
pub struct SpaceEncoder {
    state_axes: [Axis; 3],
    action_axis: Axis,
    /// Index weight of one step along each state axis
    strides: [usize; 3],
    num_states: usize,
    num_actions: usize,
}

impl SpaceEncoder {
    pub fn new(state_shape: &StateShape, action_shape: &ActionShape) -> Result<SpaceEncoder> {
        let state_axes = state_shape.axes();
        let mut cards = [0; 3];
        for (i, (axis, name)) in state_axes.iter().zip(STATE_AXIS_NAMES).enumerate() {
            axis.validate(name)?;
            let (min, max) = STATE_LABEL_RANGES[i];
            if axis.lower < min || axis.upper > max {
                return Err(SlotCarError::ShapeInvalid {
                    axis: name,
                    reason: "bounds do not fit the 6 digit state label",
                    value: i64::from(if axis.lower < min { axis.lower } else { axis.upper }),
                });
            }
            cards[i] = axis.checked_cardinality(name)?;
        }
        let action_axis = Axis::new(action_shape.lower, action_shape.upper, action_shape.step);
        action_axis.validate("action")?;
        let num_actions = action_axis.checked_cardinality("action")?;

        let too_large = |count: Option<usize>| SlotCarError::ShapeInvalid {
            axis: "table",
            reason: "more entries than the table can hold",
            value: count.map_or(i64::MAX, |c| i64::try_from(c).unwrap_or(i64::MAX)),
        };
        let num_states = cards[0]
            .checked_mul(cards[1])
            .and_then(|n| n.checked_mul(cards[2]))
            .ok_or_else(|| too_large(None))?;
        let entries = num_states.checked_mul(num_actions);
        if entries.map_or(true, |n| n > MAX_TABLE_ENTRIES) {
            return Err(too_large(entries));
        }
        let strides = [cards[1] * cards[2], cards[2], 1];

        Ok(SpaceEncoder {
            state_axes,
            action_axis,
            strides,
            num_states,
            num_actions,
        })
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn state_axes(&self) -> &[Axis; 3] {
        &self.state_axes
    }

    pub fn action_axis(&self) -> &Axis {
        &self.action_axis
    }

    pub fn is_valid_state(&self, state: &State) -> bool {
        self.state_axes
            .iter()
            .zip(state.values())
            .all(|(axis, v)| axis.contains(v))
    }

    pub fn is_valid_action(&self, action: Action) -> bool {
        self.action_axis.contains(action.0)
    }

    /// Column index of a state. The state must be valid: out-of-range values spill into
    /// neighbouring digits and yield an unrelated (or out-of-table) index.
    pub fn state_to_index(&self, state: &State) -> usize {
        debug_assert!(self.is_valid_state(state), "state {state} outside shape");
        let v = state.values();
        self.state_axes[0].digit(v[0]) * self.strides[0]
            + self.state_axes[1].digit(v[1]) * self.strides[1]
            + self.state_axes[2].digit(v[2])
    }

    /// Row index of an action. The action must be valid.
    pub fn action_to_index(&self, action: Action) -> usize {
        debug_assert!(self.is_valid_action(action), "action {action} outside shape");
        self.action_axis.digit(action.0)
    }

    pub fn checked_state_index(&self, state: &State) -> Result<usize> {
        if !self.is_valid_state(state) {
            return Err(SlotCarError::StateInvalid(state.to_string()));
        }
        Ok(self.state_to_index(state))
    }

    pub fn checked_action_index(&self, action: Action) -> Result<usize> {
        if !self.is_valid_action(action) {
            return Err(SlotCarError::ActionInvalid(action.0));
        }
        Ok(self.action_to_index(action))
    }

    /// Grid state stored at column `index`.
    pub fn index_to_state(&self, index: usize) -> Option<State> {
        if index >= self.num_states {
            return None;
        }
        let mut rest = index;
        let mut values = [0; 3];
        for i in 0..3 {
            values[i] = self.state_axes[i].value_at(rest / self.strides[i]);
            rest %= self.strides[i];
        }
        Some(State::new(values[0], values[1], values[2]))
    }

    /// Grid action stored at row `index`.
    pub fn index_to_action(&self, index: usize) -> Option<Action> {
        if index >= self.num_actions {
            return None;
        }
        Some(Action(self.action_axis.value_at(index)))
    }

    /// Builds a valid state from raw measurements, clamping each axis into its bounds.
    pub fn clamp_state(&self, severity: i32, distance: f64, speed: f64) -> State {
        let axes = &self.state_axes;
        State::new(
            severity.clamp(axes[0].lower, axes[0].upper),
            axes[1].clamp(distance),
            axes[2].clamp(speed),
        )
    }

    /// All grid states in column order.
    pub fn states(&self) -> StateIterator<'_> {
        StateIterator { encoder: self, index: 0 }
    }

    /// All grid actions in row order.
    pub fn actions(&self) -> impl Iterator<Item = Action> + '_ {
        (0..self.num_actions).filter_map(|i| self.index_to_action(i))
    }
}

pub struct StateIterator<'a> {
    encoder: &'a SpaceEncoder,
    index: usize,
}

impl<'a> Iterator for StateIterator<'a> {
    type Item = State;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.encoder.index_to_state(self.index)?;
        self.index += 1;
        Some(state)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.encoder.num_states.saturating_sub(self.index);
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use test_case::test_case;

    fn shape(lower: [i32; 3], upper: [i32; 3], step: [i32; 3]) -> StateShape {
        StateShape { lower, upper, step }
    }

    fn default_encoder() -> SpaceEncoder {
        SpaceEncoder::new(&StateShape::default(), &ActionShape::default()).unwrap()
    }

    #[test_case(shape([0, 0, 0], [1, 99, 999], [1, 30, 100]), 2 * 4 * 10; "Default shape")]
    #[test_case(shape([0, 0, 0], [1, 9, 99], [1, 1, 1]), 2 * 10 * 100; "Unit steps")]
    #[test_case(shape([1, 5, 10], [7, 20, 13], [2, 5, 3]), 4 * 4 * 2; "Offset bounds")]
    fn num_states_is_product_of_cardinalities(state_shape: StateShape, expected: usize) {
        // Act
        let encoder = SpaceEncoder::new(&state_shape, &ActionShape::default()).unwrap();
        // Assert
        assert_eq!(encoder.num_states(), expected);
    }

    #[test_case(shape([0, 0, 0], [1, 99, 999], [1, 30, 100]); "Default shape")]
    #[test_case(shape([1, 5, 10], [7, 20, 13], [2, 5, 3]); "Offset bounds")]
    fn every_index_round_trips(state_shape: StateShape) {
        let encoder = SpaceEncoder::new(&state_shape, &ActionShape::default()).unwrap();
        for k in 0..encoder.num_states() {
            let state = encoder.index_to_state(k).unwrap();
            assert!(encoder.is_valid_state(&state));
            assert_eq!(encoder.state_to_index(&state), k);
        }
        assert_eq!(encoder.index_to_state(encoder.num_states()), None);
    }

    #[test]
    fn valid_states_map_inside_table() {
        // Arrange
        let encoder = default_encoder();
        let mut columns = HashSet::new();
        // Act
        for severity in 0..=1 {
            for distance in 0..=99 {
                for speed in (0..=999).step_by(7) {
                    let k = encoder.state_to_index(&State::new(severity, distance, speed));
                    assert!(k < encoder.num_states());
                    columns.insert(k);
                }
            }
        }
        // Assert
        assert_eq!(columns.len(), encoder.num_states());
    }

    #[test]
    fn iterate_states() {
        // Arrange
        let encoder = default_encoder();
        // Act
        let states: Vec<State> = encoder.states().collect();
        // Assert
        assert_eq!(states.len(), 80);
        assert_eq!(states[0], State::new(0, 0, 0));
        assert_eq!(states[1], State::new(0, 0, 100));
        assert_eq!(states[10], State::new(0, 30, 0));
        assert_eq!(states[79], State::new(1, 90, 900));
    }

    #[test_case(30, 0; "Lowest action")]
    #[test_case(31, 0; "Between grid points")]
    #[test_case(62, 16; "Slow angle")]
    #[test_case(90, 30; "Highest action")]
    fn action_indices(action: i32, index: usize) {
        let encoder = default_encoder();
        assert_eq!(encoder.action_to_index(Action(action)), index);
    }

    #[test]
    fn actions_enumerate_grid() {
        let encoder = default_encoder();
        let actions: Vec<Action> = encoder.actions().collect();
        assert_eq!(actions.len(), 31);
        assert_eq!(actions[0], Action(30));
        assert_eq!(actions[30], Action(90));
    }

    #[test_case(shape([1, 0, 0], [1, 99, 999], [1, 30, 100]), "severity"; "Equal bounds")]
    #[test_case(shape([0, 0, 0], [1, 99, 999], [1, 0, 100]), "distance"; "Zero step")]
    #[test_case(shape([0, 0, 0], [1, 99, 999], [1, 30, -5]), "speed"; "Negative step")]
    #[test_case(shape([0, 0, 0], [1, 99, 999], [1, 100, 100]), "distance"; "Step wider than axis")]
    fn invalid_state_shapes(state_shape: StateShape, bad_axis: &str) {
        let err = SpaceEncoder::new(&state_shape, &ActionShape::default()).unwrap_err();
        match err {
            SlotCarError::ShapeInvalid { axis, .. } => assert_eq!(axis, bad_axis),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_case(shape([0, -1, 0], [1, 99, 999], [1, 30, 100]), "distance", -1; "Negative distance bound")]
    #[test_case(shape([0, 0, 0], [1, 100, 999], [1, 30, 100]), "distance", 100; "Distance wider than two digits")]
    #[test_case(shape([0, 0, 0], [10, 99, 999], [1, 30, 100]), "severity", 10; "Severity wider than one digit")]
    #[test_case(shape([0, 0, 0], [1, 99, 1000], [1, 30, 100]), "speed", 1000; "Speed wider than three digits")]
    #[test_case(shape([i32::MIN; 3], [i32::MAX; 3], [1; 3]), "severity", i64::from(i32::MIN); "Full integer range")]
    fn state_bounds_must_fit_label(state_shape: StateShape, bad_axis: &str, bad_value: i64) {
        // Act
        let err = SpaceEncoder::new(&state_shape, &ActionShape::default()).unwrap_err();
        // Assert
        match err {
            SlotCarError::ShapeInvalid { axis, value, .. } => {
                assert_eq!(axis, bad_axis);
                assert_eq!(value, bad_value);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn labels_of_valid_shape_are_fixed_width() {
        let encoder = default_encoder();
        for state in encoder.states() {
            let label = state.to_string();
            assert_eq!(label.len(), 6);
            assert_eq!(label.parse::<State>().unwrap(), state);
        }
    }

    #[test_case(ActionShape { lower: i32::MIN, upper: i32::MAX, step: 1 }; "Full integer range")]
    #[test_case(ActionShape { lower: 0, upper: 1_000_000, step: 1 }; "Too many actions for default states")]
    fn oversized_table_is_rejected(action_shape: ActionShape) {
        let err = SpaceEncoder::new(&StateShape::default(), &action_shape).unwrap_err();
        assert!(matches!(err, SlotCarError::ShapeInvalid { axis: "table", .. }));
    }

    #[test]
    fn invalid_action_shape() {
        let action_shape = ActionShape { lower: 90, upper: 30, step: 2 };
        let err = SpaceEncoder::new(&StateShape::default(), &action_shape).unwrap_err();
        assert!(matches!(err, SlotCarError::ShapeInvalid { axis: "action", value: 90, .. }));
    }

    #[test_case(State::new(0, 0, 0), true; "Lower corner")]
    #[test_case(State::new(1, 99, 999), true; "Upper corner")]
    #[test_case(State::new(2, 50, 500), false; "Severity too high")]
    #[test_case(State::new(0, -1, 500), false; "Negative distance")]
    #[test_case(State::new(0, 50, 1000), false; "Speed too high")]
    fn validate_states(state: State, valid: bool) {
        let encoder = default_encoder();
        assert_eq!(encoder.is_valid_state(&state), valid);
        assert_eq!(encoder.checked_state_index(&state).is_ok(), valid);
    }

    #[test]
    fn checked_action_index_rejects_out_of_range() {
        let encoder = default_encoder();
        assert!(matches!(
            encoder.checked_action_index(Action(92)),
            Err(SlotCarError::ActionInvalid(92))
        ));
    }

    #[test]
    fn parse_and_format_labels() {
        // Act
        let state: State = "134265".parse().unwrap();
        // Assert
        assert_eq!(state, State::new(1, 34, 265));
        assert_eq!(state.to_string(), "134265");
        assert_eq!(State::new(0, 5, 7).to_string(), "005007");
        assert!("13426".parse::<State>().is_err());
        assert!("1a4265".parse::<State>().is_err());
        assert_eq!("62".parse::<Action>().unwrap(), Action(62));
    }

    #[test]
    fn clamp_measurements() {
        let encoder = default_encoder();
        assert_eq!(encoder.clamp_state(1, 45.9, 312.4), State::new(1, 45, 312));
        assert_eq!(encoder.clamp_state(1, 150.0, 1500.0), State::new(1, 99, 999));
        assert_eq!(encoder.clamp_state(0, -3.0, f64::NAN), State::new(0, 0, 0));
    }
}
