use log::debug;

use crate::{
    error::Result,
    matrix::{ProtocolClient, protocol::RoomInfo},
};

/// Lists the joined rooms, one line per room followed by its members when
/// `list_users` is set.
///
/// A non-empty `filter` restricts the list to the rooms whose ID or machine
/// name it contains.
pub async fn rooms<C: ProtocolClient>(
    client: &C,
    filter: &[String],
    list_users: bool,
) -> Result<Vec<String>> {
    let mut rooms: Vec<RoomInfo> = client
        .rooms()
        .await?
        .into_iter()
        .filter(|room| {
            filter.is_empty()
                || filter
                    .iter()
                    .any(|wanted| *wanted == room.room_id || *wanted == room.machine_name)
        })
        .collect();
    rooms.sort_by(|a, b| a.machine_name.cmp(&b.machine_name));
    debug!("listing {} rooms", rooms.len());

    let mut lines = vec![];
    for room in &rooms {
        lines.push(format_room(room));
        if list_users {
            lines.extend(room.users.iter().map(|user| format!(" - {user}")));
        }
    }
    Ok(lines)
}

fn format_room(room: &RoomInfo) -> String {
    format!(
        "{} - {} <{}> ({} users)",
        room.machine_name, room.name, room.room_id, room.member_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::protocol::MockProtocolClient;

    fn create_rooms() -> Vec<RoomInfo> {
        vec![
            RoomInfo {
                room_id: "!b:example.org".to_owned(),
                machine_name: "#random:example.org".to_owned(),
                name: "Random".to_owned(),
                member_count: 1,
                users: vec!["@bob:example.org".to_owned()],
            },
            RoomInfo {
                room_id: "!a:example.org".to_owned(),
                machine_name: "#general:example.org".to_owned(),
                name: "General".to_owned(),
                member_count: 2,
                users: vec![
                    "@alice:example.org".to_owned(),
                    "@bob:example.org".to_owned(),
                ],
            },
        ]
    }

    fn create_client() -> MockProtocolClient {
        let mut client = MockProtocolClient::new();
        client.expect_rooms().returning(|| Ok(create_rooms()));
        client
    }

    #[tokio::test]
    async fn test_list_rooms() {
        let lines = rooms(&create_client(), &[], false).await.unwrap();
        assert_eq!(
            lines,
            vec![
                "#general:example.org - General <!a:example.org> (2 users)",
                "#random:example.org - Random <!b:example.org> (1 users)",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_rooms_with_users() {
        let filter = vec!["!a:example.org".to_owned()];
        let lines = rooms(&create_client(), &filter, true).await.unwrap();
        assert_eq!(
            lines,
            vec![
                "#general:example.org - General <!a:example.org> (2 users)",
                " - @alice:example.org",
                " - @bob:example.org",
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_by_machine_name() {
        let filter = vec!["#random:example.org".to_owned()];
        let lines = rooms(&create_client(), &filter, false).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("#random:example.org - Random"));

        let filter = vec!["#nowhere:example.org".to_owned()];
        assert!(rooms(&create_client(), &filter, false).await.unwrap().is_empty());
    }
}
