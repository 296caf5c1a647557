//! Fuzz target for stream assembly.
//!
//! Feeds arbitrary byte pieces and stop words through the assembler the way
//! a session does and checks that the released chunks always concatenate to
//! the final text.

#![no_main]

use arbitrary::Arbitrary;
use gg_session::stop::StopSet;
use gg_session::stream::StreamAssembler;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    pieces: Vec<Vec<u8>>,
    stops: Vec<String>,
}

fuzz_target!(|input: Input| {
    let Ok(stops) = StopSet::new(input.stops) else {
        return;
    };
    let mut assembler = StreamAssembler::new();
    let mut text = Vec::new();
    let mut released = Vec::new();
    let mut unscanned = 0;

    for (i, piece) in input.pieces.iter().enumerate() {
        text.extend_from_slice(piece);
        unscanned += piece.len();
        let is_final = i + 1 == input.pieces.len();
        if assembler.track_multibyte(piece) && !is_final {
            continue;
        }
        let window = assembler.emit(&mut text, unscanned, &stops, is_final);
        unscanned = 0;
        released.extend_from_slice(&window.content);
        if let Some(found) = window.stop {
            assert_eq!(found.position, text.len());
            break;
        }
    }

    assert_eq!(released, text, "chunks must concatenate to the generated text");
    assert_eq!(assembler.sent(), text.len());
});
