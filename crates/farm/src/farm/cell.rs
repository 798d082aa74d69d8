// Get-or-create cell for the application boundary
//
// Library code takes a `Farm` explicitly; only an embedding binary that needs
// one process-wide farm should reach for this.

use tokio::sync::OnceCell;

use super::Farm;
use crate::error::Result;

/// Holds at most one farm, created on first use
#[derive(Debug, Default)]
pub struct FarmCell {
    cell: OnceCell<Farm>,
}

impl FarmCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Return the farm, building it with `create` if there is none yet
    ///
    /// A failed `create` leaves the cell empty.
    pub async fn get_or_create<F>(&self, create: F) -> Result<Farm>
    where
        F: FnOnce() -> Result<Farm>,
    {
        self.cell
            .get_or_try_init(|| async { create() })
            .await
            .cloned()
    }

    pub fn get(&self) -> Option<Farm> {
        self.cell.get().cloned()
    }

    /// End the farm, if one was created
    pub async fn end(&self) -> Result<()> {
        match self.cell.get() {
            Some(farm) => farm.end().await,
            None => Ok(()),
        }
    }
}
