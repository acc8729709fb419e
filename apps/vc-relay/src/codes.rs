use rand::Rng;

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ROOM_CODE_LEN: usize = 5;
const PLAYER_CODE_LEN: usize = 4;

fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// Generate a candidate room code. Uniqueness against the live registry is
/// the caller's responsibility.
pub fn generate_room_code() -> String {
    random_code(ROOM_CODE_LEN)
}

/// Generate a candidate identity code for a player. Uniqueness within the
/// room's code table is the caller's responsibility.
pub fn generate_player_code() -> String {
    random_code(PLAYER_CODE_LEN)
}

/// Room codes arriving on a connection URL must be 4-16 alphanumeric
/// characters before we even look them up.
pub fn is_valid_room_code(code: &str) -> bool {
    (4..=16).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}
