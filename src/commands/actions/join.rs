use log::{error, info};

use crate::{
    error::{Error, Result},
    matrix::ProtocolClient,
};

/// Joins every room of `rooms`.
///
/// A failure does not prevent the next rooms from being joined, the last one
/// is returned.
pub async fn join<C: ProtocolClient>(client: &C, rooms: &[String]) -> Result<()> {
    let mut result = Ok(());
    for room in rooms {
        match client.join(room).await {
            Ok(room_id) => info!("joined {} ({})", room, room_id),
            Err(e) => {
                error!("failed to join {}: {}", room, e);
                result = Err(Error::Client(e));
            }
        }
    }
    result
}
