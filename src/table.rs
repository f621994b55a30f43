use std::fs::File;
use std::io;
use std::path::Path;

use rand::Rng;
use tracing::info;

use crate::error::Result;
use crate::space::{Action, ActionShape, SpaceEncoder, State, StateShape};

/// Dense action-value store.
///
/// Rows are actions and columns are states, both indexed through the [`SpaceEncoder`].
/// Every entry starts at zero.
///
/// Lookups and updates do not re-validate their arguments: callers check states with
/// [`SpaceEncoder::is_valid_state`] (and actions with `is_valid_action`) first. An
/// out-of-range state either aliases another column or panics on the ndarray bounds check.
/// It is never an unchecked memory access.
#[derive(Debug, Clone)]
pub struct ActionValueTable {
    encoder: SpaceEncoder,
    /// Indexes: action row, state column
    values: ndarray::Array2<f64>,
}

impl ActionValueTable {
    pub fn new(state_shape: &StateShape, action_shape: &ActionShape) -> Result<ActionValueTable> {
        let encoder = SpaceEncoder::new(state_shape, action_shape)?;
        Ok(ActionValueTable::from_encoder(encoder))
    }

    pub fn from_encoder(encoder: SpaceEncoder) -> ActionValueTable {
        let dim = (encoder.num_actions(), encoder.num_states());
        info!(actions = dim.0, states = dim.1, "allocating action-value table");
        let values = ndarray::Array2::<f64>::zeros(dim);
        ActionValueTable { encoder, values }
    }

    pub fn encoder(&self) -> &SpaceEncoder {
        &self.encoder
    }

    pub fn values(&self) -> &ndarray::Array2<f64> {
        &self.values
    }

    pub fn get(&self, state: &State, action: Action) -> f64 {
        self.values[[
            self.encoder.action_to_index(action),
            self.encoder.state_to_index(state),
        ]]
    }

    pub fn set(&mut self, state: &State, action: Action, value: f64) {
        let idx = [
            self.encoder.action_to_index(action),
            self.encoder.state_to_index(state),
        ];
        self.values[idx] = value;
    }

    /// Largest value stored for any action in the state's column.
    pub fn max_value(&self, state: &State) -> f64 {
        let column = self.values.column(self.encoder.state_to_index(state));
        column.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Action with the largest value in the state's column.
    ///
    /// Ties go to the lowest-indexed action: rows are scanned in ascending order and only
    /// a strictly greater value replaces the current best.
    pub fn argmax_action(&self, state: &State) -> Action {
        let column = self.values.column(self.encoder.state_to_index(state));
        let mut best_row = 0;
        let mut best_value = f64::NEG_INFINITY;
        for (row, &value) in column.iter().enumerate() {
            if value > best_value {
                best_row = row;
                best_value = value;
            }
        }
        self.action_at(best_row)
    }

    /// Uniform draw over the whole action grid, independent of state.
    pub fn random_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        self.action_at(rng.gen_range(0..self.encoder.num_actions()))
    }

    fn action_at(&self, row: usize) -> Action {
        // Rows always come from 0..num_actions.
        self.encoder
            .index_to_action(row)
            .unwrap_or(Action(self.encoder.action_axis().lower))
    }

    /// Forget everything learned so far.
    pub fn reset(&mut self) {
        self.values.fill(0.0);
    }

    /// Writes the table as text: a header of state labels, then one row per action with
    /// every value in scientific notation (2 significant digits).
    pub fn write_dump<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::WriterBuilder::new().from_writer(writer);
        let mut header = vec![String::from("action")];
        header.extend(self.encoder.states().map(|s| s.to_string()));
        out.write_record(&header)?;

        for (row, action) in self.values.rows().into_iter().zip(self.encoder.actions()) {
            let mut record = vec![action.to_string()];
            record.extend(row.iter().map(|v| format!("{v:.1e}")));
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn save_dump(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "writing action-value table");
        self.write_dump(File::create(path)?)
    }
}
