//! Relay path selection.
//!
//! Relays are drawn uniformly at random from the online set with an OS-backed
//! CSPRNG (Fisher-Yates via `SliceRandom::shuffle`). An explicit exit, if
//! given, is pinned as the last hop and never appears earlier in the path.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tracing::debug;

use ptor_types::directory::RelayInfo;
use ptor_types::MAX_CIRCUIT_HOPS;

use crate::{OnionError, Result};

/// Pick `hops` distinct online relays. With `exit` set, that relay is the
/// final hop and `hops - 1` others precede it.
pub fn select_path(
    relays: &[RelayInfo],
    hops: usize,
    exit: Option<&str>,
) -> Result<Vec<RelayInfo>> {
    if hops == 0 || hops > MAX_CIRCUIT_HOPS {
        return Err(OnionError::InvalidHopCount(hops));
    }

    let mut pool: Vec<RelayInfo> = relays.iter().filter(|r| r.online).cloned().collect();

    let exit = match exit {
        Some(id) => {
            let pos = pool
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| OnionError::ExitUnavailable(id.to_string()))?;
            Some(pool.swap_remove(pos))
        }
        None => None,
    };

    let need = if exit.is_some() { hops - 1 } else { hops };
    if pool.len() < need {
        return Err(OnionError::InsufficientRelays {
            need: hops,
            have: pool.len() + usize::from(exit.is_some()),
        });
    }

    pool.shuffle(&mut OsRng);
    pool.truncate(need);
    pool.extend(exit);

    debug!(
        hops,
        path = ?pool.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        "selected relay path"
    );
    Ok(pool)
}
