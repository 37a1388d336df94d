#[derive(Clone, Copy)]
pub(super) enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
}

pub(super) fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

pub(super) fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Whether `token` starts at `idx` as a standalone word (ASCII case-insensitive).
pub(super) fn token_at(bytes: &[u8], idx: usize, token: &[u8]) -> bool {
    let end = idx + token.len();
    if end > bytes.len() || !bytes[idx..end].eq_ignore_ascii_case(token) {
        return false;
    }
    let clean_start = idx == 0 || !(is_word_byte(bytes[idx - 1]) || bytes[idx - 1] == token[0]);
    let clean_end = bytes.get(end).is_none_or(|b| !is_word_byte(*b));
    clean_start && clean_end
}

/// Advance the lexical state by one position, returning how many extra bytes were consumed.
pub(super) fn step(state: &mut State, bytes: &[u8], idx: usize) -> usize {
    let b = bytes[idx];
    match *state {
        State::Normal => match b {
            b'\'' => *state = State::SingleQuoted,
            b'"' => *state = State::DoubleQuoted,
            _ if is_line_comment_start(bytes, idx) => {
                *state = State::LineComment;
                return 1;
            }
            _ if is_block_comment_start(bytes, idx) => {
                *state = State::BlockComment(1);
                return 1;
            }
            _ => {}
        },
        State::SingleQuoted => {
            if b == b'\'' {
                if bytes.get(idx + 1) == Some(&b'\'') {
                    return 1; // escaped quote
                }
                *state = State::Normal;
            }
        }
        State::DoubleQuoted => {
            if b == b'"' {
                if bytes.get(idx + 1) == Some(&b'"') {
                    return 1; // escaped quote
                }
                *state = State::Normal;
            }
        }
        State::LineComment => {
            if b == b'\n' {
                *state = State::Normal;
            }
        }
        State::BlockComment(depth) => {
            if is_block_comment_start(bytes, idx) {
                *state = State::BlockComment(depth + 1);
                return 1;
            } else if is_block_comment_end(bytes, idx) {
                *state = if depth == 1 {
                    State::Normal
                } else {
                    State::BlockComment(depth - 1)
                };
                return 1;
            }
        }
    }
    0
}
