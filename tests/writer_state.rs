use std::io::{self, Write};

use secrecy::SecretString;
use shardseal::{
    CipherMode, CodecError, CodecOptions, ErrorKind, KdfParams, ResistMode, StreamWriter,
    decode_bytes,
};

/// Sink that starts failing after `budget` bytes.
struct FailingSink {
    written: Vec<u8>,
    budget: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written.len() + buf.len() > self.budget {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn write_after_close_is_stream_closed() {
    let opts = CodecOptions::default();
    let mut w =
        StreamWriter::new(Vec::new(), ResistMode::ReedSolomon, CipherMode::None, &opts).unwrap();
    w.write_all(b"abc").unwrap();
    w.close().unwrap();
    assert!(w.is_closed());

    let err = w.write(b"more").unwrap_err();
    assert!(matches!(CodecError::from_io(&err), Some(CodecError::StreamClosed)));
    assert!(matches!(w.append(b"more"), Err(CodecError::StreamClosed)));
}

#[test]
fn close_is_idempotent() {
    let opts = CodecOptions::default().with_chunk_size(4);
    let mut w = StreamWriter::new(Vec::new(), ResistMode::None, CipherMode::None, &opts).unwrap();
    w.write_all(b"abcdef").unwrap();
    w.close().unwrap();
    let chunks = w.chunks_written();
    w.close().unwrap();
    w.close().unwrap();
    assert_eq!(w.chunks_written(), chunks);
    assert_eq!(chunks, 2);
}

#[test]
fn drop_finalizes_the_stream() {
    let opts = CodecOptions::default().with_chunk_size(8);
    let mut sink = Vec::new();
    {
        let mut w =
            StreamWriter::new(&mut sink, ResistMode::None, CipherMode::None, &opts).unwrap();
        w.write_all(b"dropped without close").unwrap();
    }
    assert_eq!(decode_bytes(&sink, &opts).unwrap(), b"dropped without close");
}

#[test]
fn sink_errors_propagate_unchanged() {
    let opts = CodecOptions::default().with_chunk_size(16);
    let sink = FailingSink {
        written: Vec::new(),
        budget: 200,
    };
    let mut w = StreamWriter::new(sink, ResistMode::None, CipherMode::None, &opts).unwrap();
    let err = w.write_all(&[0u8; 1000]).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::StorageFull);
    assert!(CodecError::from_io(&err).is_none());
    assert!(w.is_closed());
}

#[test]
fn header_write_failure_is_an_io_error() {
    let opts = CodecOptions::default();
    let sink = FailingSink {
        written: Vec::new(),
        budget: 4,
    };
    let res = StreamWriter::new(sink, ResistMode::ReedSolomon, CipherMode::None, &opts);
    match res {
        Err(e) => assert_eq!(e.kind(), ErrorKind::Io),
        Ok(_) => panic!("header write should fail"),
    }
}

#[test]
fn configuration_errors() {
    let opts = CodecOptions::default();
    let cases: Vec<(CodecOptions, ResistMode, CipherMode)> = vec![
        (opts.clone(), ResistMode::None, CipherMode::Aead),
        (
            opts.clone().with_password(SecretString::new("".into())),
            ResistMode::None,
            CipherMode::Aead,
        ),
        (opts.clone().with_pieces(0, 8, 1), ResistMode::ReedSolomon, CipherMode::None),
        (opts.clone().with_pieces(16, 0, 1), ResistMode::ReedSolomon, CipherMode::None),
        (opts.clone().with_pieces(16, 8, 0), ResistMode::ReedSolomon, CipherMode::None),
        (opts.clone().with_pieces(16, 200, 57), ResistMode::ReedSolomon, CipherMode::None),
        (opts.clone().with_chunk_size(0), ResistMode::None, CipherMode::None),
        (
            opts.clone()
                .with_password(SecretString::new("pw".into()))
                .with_kdf_params(KdfParams {
                    t_cost: 0,
                    mem_kib: 64,
                    parallelism: 1,
                }),
            ResistMode::None,
            CipherMode::Aead,
        ),
    ];
    for (i, (o, resist, cipher)) in cases.into_iter().enumerate() {
        let mut sink = Vec::new();
        {
            let res = StreamWriter::new(&mut sink, resist, cipher, &o);
            let err = match res {
                Err(e) => e,
                Ok(_) => panic!("case {i} should fail"),
            };
            assert_eq!(err.kind(), ErrorKind::Configuration, "case {i}: {err}");
        }
        assert!(sink.is_empty(), "case {i} wrote before failing");
    }
}
