use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ambe_api::{AmbeFrame, Api, Rate, FRAME_SIZE};
use tracing::info;

use crate::cmd::TranscodeArgs;
use crate::connection::Connection;
use crate::exit::{api_error, io_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: TranscodeArgs) -> CliResult<i32> {
    let rate: Rate = args
        .rate
        .parse()
        .map_err(|err| api_error("parse rate", err))?;

    let input = load_pcm(&args.input)?;
    info!(
        frames = input.len(),
        seconds = input.len() as f64 * 0.02,
        "loaded audio"
    );

    let connection = Connection::open(&args.uri)?;
    let outcome = transcode(&connection, &args, rate, &input);
    connection.close();
    outcome
}

fn transcode(
    connection: &Connection,
    args: &TranscodeArgs,
    rate: Rate,
    input: &[Vec<i16>],
) -> CliResult<i32> {
    let api = &connection.api;

    if connection.is_local() {
        // Bring the chip to a known state before configuring it, the same
        // sequence a fresh server run uses.
        info!("resetting device");
        api.reset(true).map_err(|err| api_error("reset", err))?;
        api.parity_mode(false)
            .map_err(|err| api_error("disable parity", err))?;
        api.compand(false, false)
            .map_err(|err| api_error("disable companding", err))?;
    }

    let prodid = api.prodid().map_err(|err| api_error("prodid", err))?;
    let version = api.verstring().map_err(|err| api_error("verstring", err))?;
    info!(%prodid, %version, "found AMBE device");

    let channels = match args.channels {
        None => connection.channels(),
        Some(n) if n >= 1 && n <= connection.channels() => n,
        Some(n) => {
            return Err(CliError::new(
                USAGE,
                format!("device has {} channels, requested {n}", connection.channels()),
            ))
        }
    };

    info!(%rate, channels, "configuring channels");
    for slot in 0..channels {
        let channel = connection.channel_id(slot);
        api.rate(channel, &rate)
            .map_err(|err| api_error("set rate", err))?;
        api.init(channel, true, true)
            .map_err(|err| api_error("init channel", err))?;
    }

    let mut outputs: Vec<Vec<Vec<i16>>> = vec![Vec::new(); channels];
    let collect = args.output.is_some();

    if args.concurrent {
        run_concurrent(
            connection,
            input,
            channels,
            args.pipeline as usize,
            collect.then_some(&mut outputs),
        )?;
    } else {
        run_synchronous(connection, input, channels, collect.then_some(&mut outputs))?;
    }

    if let Some(output) = &args.output {
        for (slot, frames) in outputs.iter().enumerate() {
            let path = output_path(output, slot, channels);
            info!(path = %path.display(), "writing audio");
            save_pcm(&path, frames)?;
        }
    } else {
        info!("discarding audio (no output file configured)");
    }

    Ok(SUCCESS)
}

/// One frame at a time per channel: compress, wait, decompress, wait.
fn run_synchronous(
    connection: &Connection,
    input: &[Vec<i16>],
    channels: usize,
    mut outputs: Option<&mut Vec<Vec<Vec<i16>>>>,
) -> CliResult<()> {
    info!("running in synchronous mode");
    let api = &connection.api;

    let timings = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..channels)
            .map(|slot| {
                let channel = connection.channel_id(slot);
                scope.spawn(move || -> CliResult<(Duration, Vec<Vec<i16>>)> {
                    let started = Instant::now();
                    let mut decoded = Vec::new();
                    for frame in input {
                        let compressed = api
                            .compress(channel, frame)
                            .map_err(|err| api_error("compress", err))?
                            .wait()
                            .map_err(|err| api_error("compress", err.into()))?;
                        let bits = AmbeFrame::from_response(&compressed)
                            .map_err(|err| api_error("compress", err))?;

                        let speech = api
                            .decompress(channel, bits.data(), bits.bits())
                            .map_err(|err| api_error("decompress", err))?
                            .wait()
                            .map_err(|err| api_error("decompress", err.into()))?;
                        decoded.push(
                            speech
                                .samples()
                                .map_err(|err| api_error("decompress", err.into()))?,
                        );
                    }
                    Ok((started.elapsed(), decoded))
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().expect("transcode worker panicked"))
            .collect::<CliResult<Vec<_>>>()
    })?;

    for (slot, (elapsed, decoded)) in timings.into_iter().enumerate() {
        info!(channel = connection.channel_id(slot), ?elapsed, "channel done");
        if let Some(outputs) = outputs.as_deref_mut() {
            outputs[slot] = decoded;
        }
    }
    Ok(())
}

/// Keep `pipeline` requests in flight per direction on every channel, with
/// compression and decompression running at the same time.
fn run_concurrent(
    connection: &Connection,
    input: &[Vec<i16>],
    channels: usize,
    pipeline: usize,
    mut outputs: Option<&mut Vec<Vec<Vec<i16>>>>,
) -> CliResult<()> {
    info!(pipeline, "running in concurrent mode");
    let api = &connection.api;

    // Compress once up front so the decompressors have real channel bits.
    info!("pre-compressing input");
    let mut compressed = Vec::with_capacity(input.len());
    let elapsed = compress_stream(api, connection.channel_id(0), input, pipeline, |frame| {
        compressed.push(frame)
    })?;
    info!(?elapsed, "pre-compression done");

    let results = std::thread::scope(|scope| {
        let mut workers = Vec::new();
        for slot in 0..channels {
            let channel = connection.channel_id(slot);
            let compressed = &compressed;

            workers.push(scope.spawn(move || -> CliResult<(Duration, Vec<Vec<i16>>)> {
                let elapsed = compress_stream(api, channel, input, pipeline, |_frame| {})?;
                Ok((elapsed, Vec::new()))
            }));
            workers.push(scope.spawn(move || -> CliResult<(Duration, Vec<Vec<i16>>)> {
                let mut decoded = Vec::new();
                let elapsed =
                    decompress_stream(api, channel, compressed, pipeline, |samples| {
                        decoded.push(samples)
                    })?;
                Ok((elapsed, decoded))
            }));
        }

        workers
            .into_iter()
            .map(|worker| worker.join().expect("transcode worker panicked"))
            .collect::<CliResult<Vec<_>>>()
    })?;

    for (index, (elapsed, decoded)) in results.into_iter().enumerate() {
        let slot = index / 2;
        let direction = if index % 2 == 0 { "compress" } else { "decompress" };
        info!(
            channel = connection.channel_id(slot),
            direction,
            ?elapsed,
            "channel done"
        );
        if !decoded.is_empty() {
            if let Some(outputs) = outputs.as_deref_mut() {
                outputs[slot] = decoded;
            }
        }
    }
    Ok(())
}

/// Feed frames through the compressor, keeping up to `pipeline` requests in
/// flight, handing each compressed frame to `sink` in order.
fn compress_stream(
    api: &Api,
    channel: u8,
    input: &[Vec<i16>],
    pipeline: usize,
    mut sink: impl FnMut(AmbeFrame),
) -> CliResult<Duration> {
    let started = Instant::now();
    let mut pending = VecDeque::with_capacity(pipeline);

    for frame in input {
        if pending.len() == pipeline {
            let response: ambe_sched::PendingResponse = pending.pop_front().unwrap();
            let response = response
                .wait()
                .map_err(|err| api_error("compress", err.into()))?;
            sink(AmbeFrame::from_response(&response).map_err(|err| api_error("compress", err))?);
        }
        pending.push_back(
            api.compress(channel, frame)
                .map_err(|err| api_error("compress", err))?,
        );
    }

    for response in pending {
        let response = response
            .wait()
            .map_err(|err| api_error("compress", err.into()))?;
        sink(AmbeFrame::from_response(&response).map_err(|err| api_error("compress", err))?);
    }
    Ok(started.elapsed())
}

/// The decompression mirror of [`compress_stream`].
fn decompress_stream(
    api: &Api,
    channel: u8,
    input: &[AmbeFrame],
    pipeline: usize,
    mut sink: impl FnMut(Vec<i16>),
) -> CliResult<Duration> {
    let started = Instant::now();
    let mut pending = VecDeque::with_capacity(pipeline);

    for frame in input {
        if pending.len() == pipeline {
            let response: ambe_sched::PendingResponse = pending.pop_front().unwrap();
            let response = response
                .wait()
                .map_err(|err| api_error("decompress", err.into()))?;
            sink(
                response
                    .samples()
                    .map_err(|err| api_error("decompress", err.into()))?,
            );
        }
        pending.push_back(
            api.decompress(channel, frame.data(), frame.bits())
                .map_err(|err| api_error("decompress", err))?,
        );
    }

    for response in pending {
        let response = response
            .wait()
            .map_err(|err| api_error("decompress", err.into()))?;
        sink(
            response
                .samples()
                .map_err(|err| api_error("decompress", err.into()))?,
        );
    }
    Ok(started.elapsed())
}

/// Read raw s16le PCM into chip-sized frames, zero-padding the tail.
fn load_pcm(path: &Path) -> CliResult<Vec<Vec<i16>>> {
    let bytes = std::fs::read(path).map_err(|err| io_error("read input", err))?;
    if bytes.len() % 2 != 0 {
        return Err(CliError::new(
            USAGE,
            "input is not 16-bit PCM (odd byte count)",
        ));
    }

    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Ok(samples
        .chunks(FRAME_SIZE)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(FRAME_SIZE, 0);
            frame
        })
        .collect())
}

/// Write frames back as raw s16le PCM.
fn save_pcm(path: &Path, frames: &[Vec<i16>]) -> CliResult<()> {
    let mut bytes = Vec::with_capacity(frames.len() * FRAME_SIZE * 2);
    for frame in frames {
        for sample in frame {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    std::fs::write(path, bytes).map_err(|err| io_error("write output", err))
}

/// `out.pcm` stays `out.pcm` for one channel, becomes `out.0.pcm`,
/// `out.1.pcm`, ... for several.
fn output_path(base: &Path, slot: usize, channels: usize) -> PathBuf {
    if channels <= 1 {
        return base.to_path_buf();
    }
    match base.extension() {
        Some(ext) => base.with_extension(format!("{slot}.{}", ext.to_string_lossy())),
        None => base.with_extension(slot.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trips_with_padding() {
        let dir = std::env::temp_dir().join(format!("ambe-pcm-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("in.pcm");

        // 250 samples: one full frame plus a 90-sample tail.
        let samples: Vec<i16> = (0..250).map(|i| i as i16 - 125).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        let frames = load_pcm(&path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), FRAME_SIZE);
        assert_eq!(frames[1][89], samples[249]);
        assert_eq!(frames[1][90], 0);

        let out = dir.join("out.pcm");
        save_pcm(&out, &frames).unwrap();
        assert_eq!(
            std::fs::read(&out).unwrap().len(),
            2 * FRAME_SIZE * frames.len()
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_odd_byte_counts() {
        let dir = std::env::temp_dir().join(format!("ambe-pcm-odd-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("odd.pcm");
        std::fs::write(&path, [0u8; 3]).unwrap();

        let err = load_pcm(&path).unwrap_err();
        assert_eq!(err.code, USAGE);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn output_paths_gain_channel_indices() {
        let base = PathBuf::from("/tmp/out.pcm");
        assert_eq!(output_path(&base, 0, 1), base);
        assert_eq!(output_path(&base, 1, 3), PathBuf::from("/tmp/out.1.pcm"));
        assert_eq!(
            output_path(&PathBuf::from("/tmp/out"), 2, 3),
            PathBuf::from("/tmp/out.2")
        );
    }
}
