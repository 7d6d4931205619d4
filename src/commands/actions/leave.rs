use log::{error, info};

use crate::{
    error::{Error, Result},
    matrix::{ClientError, ProtocolClient},
};

/// Leaves and forgets every room of `rooms`, aliases are resolved first.
pub async fn leave<C: ProtocolClient>(client: &C, rooms: &[String]) -> Result<()> {
    let mut result = Ok(());
    for room in rooms {
        if let Err(e) = leave_room(client, room).await {
            error!("failed to leave {}: {}", room, e);
            result = Err(Error::Client(e));
        }
    }
    result
}

async fn leave_room<C: ProtocolClient>(
    client: &C,
    room: &str,
) -> std::result::Result<(), ClientError> {
    let room_id = client.resolve_room(room).await?;
    client.leave(&room_id).await?;
    client.forget(&room_id).await?;
    info!("left {} ({})", room, room_id);
    Ok(())
}
