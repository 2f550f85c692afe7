use proptest::prelude::*;

use airspeed::{Template, Value};

const MAX_TEXT_LEN: usize = 256;

/// Characters with no template meaning: anything but `$`, `#`, and `\`.
fn plain_text() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            prop::char::range(' ', '~').prop_filter("no template sigils", |c| {
                !matches!(c, '$' | '#' | '\\')
            }),
            Just('\n'),
            Just('\t'),
            prop::char::range('\u{a0}', '\u{2ff}'),
        ],
        0..=MAX_TEXT_LEN,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

proptest! {
    /// A template containing no `$`, `#`, or `\` renders to itself.
    #[test]
    fn sigil_free_text_renders_verbatim(text in plain_text()) {
        let template = Template::new(&text).expect("parse");
        let rendered = template.merge(&Value::Map(Vec::new()), None).expect("merge");
        prop_assert_eq!(rendered, text);
    }

    /// Doubling every sigil through an escape renders the original text.
    #[test]
    fn escaped_sigils_render_literally(text in plain_text()) {
        let mut source = String::new();
        let mut expected = String::new();
        for (i, ch) in text.chars().enumerate() {
            if i % 7 == 0 {
                let sigil = if i % 14 == 0 { '$' } else { '#' };
                source.push('\\');
                source.push(sigil);
                expected.push(sigil);
            }
            source.push(ch);
            expected.push(ch);
        }
        let template = Template::new(&source).expect("parse");
        let rendered = template.merge(&Value::Map(Vec::new()), None).expect("merge");
        prop_assert_eq!(rendered, expected);
    }
}
