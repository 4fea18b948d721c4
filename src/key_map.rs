//! Translates printable characters into QEMU monitor `sendkey` tokens.

/// Characters with a dedicated `sendkey` token. Anything not in this table is
/// passed straight through, which lets callers hand in multi-character key
/// names (`ctrl-alt-f1`) as well as characters that already equal their own
/// keysym (lowercase letters, plain digits).
///
/// This table must be reproduced byte-for-byte against the guests it targets;
/// do not "clean it up" by deriving entries algorithmically.
const CHAR_TO_KEY: &[(char, &str)] = &[
    ('A', "shift-a"),
    ('N', "shift-n"),
    ('-', "0x0C"),
    ('_', "shift-0x0C"),
    ('B', "shift-b"),
    ('O', "shift-o"),
    ('=', "0x0D"),
    ('+', "shift-0x0D"),
    ('C', "shift-c"),
    ('P', "shift-p"),
    ('[', "0x1A"),
    ('{', "shift-0x1A"),
    ('D', "shift-d"),
    ('Q', "shift-q"),
    (']', "0x1B"),
    ('}', "shift-0x1B"),
    ('E', "shift-e"),
    ('R', "shift-r"),
    (';', "0x27"),
    (':', "shift-0x27"),
    ('F', "shift-f"),
    ('S', "shift-s"),
    ('\'', "0x28"),
    ('"', "shift-0x28"),
    ('G', "shift-g"),
    ('T', "shift-t"),
    ('`', "0x29"),
    ('~', "shift-0x29"),
    ('H', "shift-h"),
    ('U', "shift-u"),
    ('\\', "0x2B"),
    ('|', "shift-0x2B"),
    ('I', "shift-i"),
    ('V', "shift-v"),
    (',', "0x33"),
    ('<', "shift-0x33"),
    ('J', "shift-j"),
    ('W', "shift-w"),
    ('.', "0x34"),
    ('>', "shift-0x34"),
    ('K', "shift-k"),
    ('X', "shift-x"),
    ('/', "0x35"),
    ('?', "shift-0x35"),
    ('L', "shift-l"),
    ('Y', "shift-y"),
    (' ', "spc"),
    ('M', "shift-m"),
    ('Z', "shift-z"),
    ('\n', "ret"),
    ('!', "shift-0x02"),
    ('@', "shift-0x03"),
    ('#', "shift-0x04"),
    ('$', "shift-0x05"),
    ('%', "shift-0x06"),
    ('^', "shift-0x07"),
    ('&', "shift-0x08"),
    ('*', "shift-0x09"),
    ('(', "shift-0x0A"),
    (')', "shift-0x0B"),
];

/// Translate a single key name into the token QEMU's monitor `sendkey`
/// command expects.
///
/// If `key` is a single character present in the table, the mapped token is
/// returned. Otherwise `key` is returned unchanged, which covers both
/// characters that already equal their own keysym (e.g. `"a"`, `"1"`) and
/// multi-character key names callers may pass straight through (e.g.
/// `"ctrl-alt-f1"`).
pub fn translate(key: &str) -> &str {
    let mut chars = key.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return key;
    };

    CHAR_TO_KEY
        .iter()
        .find(|(k, _)| *k == c)
        .map(|(_, token)| *token)
        .unwrap_or(key)
}
