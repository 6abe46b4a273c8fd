//! The operation surface exposed to external callers (the RPC layer is
//! out of scope; it calls these functions). Mutations trigger procedures
//! and honor the `synchronous` flag; reads answer directly from the
//! catalog.

pub mod group;
pub mod server;
pub mod sharding;

use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::executor::{ProcedureStatus, Step};

/// Trigger a procedure and either wait for it or hand back its id with
/// whatever has been recorded so far.
pub(crate) async fn run(
    engine: &Engine,
    name: &str,
    locks: impl IntoIterator<Item = String>,
    entry: Step,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let id = engine.executor().trigger(name, locks, entry);

    if synchronous {
        engine
            .executor()
            .wait(&id)
            .await
            .ok_or_else(|| Error::server(format!("procedure ({}) disappeared", id)))
    } else {
        engine
            .executor()
            .status(&id)
            .ok_or_else(|| Error::server(format!("procedure ({}) disappeared", id)))
    }
}

/// Fetch step records of a procedure by id.
pub fn procedure_status(engine: &Engine, id: &Uuid) -> Option<ProcedureStatus> {
    engine.executor().status(id)
}
