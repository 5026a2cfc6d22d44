//! Write-request codec
//!
//! Batches are serialized as a Prometheus remote write `WriteRequest` and
//! compressed with snappy's raw block format. Every call allocates its own
//! buffers, so concurrent calls never share state.
//!
//! The module also owns the conservative size estimates the batcher uses to
//! keep batches under the byte budget: for any batch the serialized
//! (uncompressed) length never exceeds the sum of [`series_overhead`] per
//! series and [`SAMPLE_MAX_ENCODED_LEN`] per sample.

pub mod proto;

use bytes::Bytes;
use prost::Message;
use prost::encoding::encoded_len_varint;
use thiserror::Error;

use crate::types::{Batch, Label, Labels, LabelsError, Sample, TimeSeries};

/// Largest decompressed payload accepted by the decoders.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// Upper bound of one sample inside a series: field key, length prefix,
/// `double` (key + 8 bytes) and `int64` (key + up to 10 varint bytes).
pub const SAMPLE_MAX_ENCODED_LEN: usize = 1 + 1 + 9 + 11;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot serialize write request: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("snappy compression failed: {0}")]
    Compress(#[source] snap::Error),
    #[error("payload is empty")]
    Empty,
    #[error("snappy decompression failed: {0}")]
    Decompress(#[source] snap::Error),
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<LabelsError> for CodecError {
    fn from(error: LabelsError) -> Self {
        Self::InvalidMessage(error.to_string())
    }
}

/// A compressed batch ready to be sent.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Bytes,
    pub series: usize,
    pub samples: usize,
    pub uncompressed_len: usize,
}

/// Decoded response body of a remote write endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acknowledgement {
    pub series: Vec<TimeSeries>,
}

impl Acknowledgement {
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }
}

/// Serialized length bound of a series header: its field key, a length prefix
/// and every label.
pub fn series_overhead(labels: &Labels) -> usize {
    1 + MAX_VARINT_LEN + labels.iter().map(label_encoded_len).sum::<usize>()
}

fn label_encoded_len(label: &Label) -> usize {
    let inner = string_field_len(&label.name) + string_field_len(&label.value);
    1 + encoded_len_varint(inner as u64) + inner
}

fn string_field_len(s: &str) -> usize {
    1 + encoded_len_varint(s.len() as u64) + s.len()
}

pub fn encode(batch: &Batch) -> Result<EncodedBatch, CodecError> {
    let request = proto::WriteRequest {
        timeseries: batch.series.iter().map(series_to_proto).collect(),
    };
    let raw = encode_message(&request)?;
    let body = compress(&raw)?;

    Ok(EncodedBatch {
        body,
        series: batch.series_count(),
        samples: batch.sample_count(),
        uncompressed_len: raw.len(),
    })
}

/// Reverses [`encode`]. Either the whole batch decodes or an error is returned.
pub fn decode_write_request(bytes: &[u8]) -> Result<Batch, CodecError> {
    let raw = decompress(bytes)?;
    let request = proto::WriteRequest::decode(raw.as_slice())?;
    let series = request
        .timeseries
        .into_iter()
        .map(series_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Batch {
        series,
        estimated_bytes: raw.len(),
    })
}

pub fn encode_ack(ack: &Acknowledgement) -> Result<Bytes, CodecError> {
    let response = proto::ReadResponse {
        results: vec![proto::QueryResult {
            timeseries: ack.series.iter().map(series_to_proto).collect(),
        }],
    };
    compress(&encode_message(&response)?)
}

pub fn decode_ack(bytes: &[u8]) -> Result<Acknowledgement, CodecError> {
    let raw = decompress(bytes)?;
    let response = proto::ReadResponse::decode(raw.as_slice())?;
    let series = response
        .results
        .into_iter()
        .flat_map(|result| result.timeseries)
        .map(series_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Acknowledgement { series })
}

fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, CodecError> {
    let len = message.encoded_len();
    if len > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::TooLarge {
            len,
            max: MAX_DECOMPRESSED_LEN,
        });
    }
    let mut raw = Vec::with_capacity(len);
    message.encode(&mut raw)?;
    Ok(raw)
}

fn compress(raw: &[u8]) -> Result<Bytes, CodecError> {
    snap::raw::Encoder::new()
        .compress_vec(raw)
        .map(Bytes::from)
        .map_err(CodecError::Compress)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let len = snap::raw::decompress_len(bytes).map_err(CodecError::Decompress)?;
    if len > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::TooLarge {
            len,
            max: MAX_DECOMPRESSED_LEN,
        });
    }
    snap::raw::Decoder::new()
        .decompress_vec(bytes)
        .map_err(CodecError::Decompress)
}

fn series_to_proto(series: &TimeSeries) -> proto::TimeSeries {
    proto::TimeSeries {
        labels: series
            .labels
            .iter()
            .map(|l| proto::Label {
                name: l.name.clone(),
                value: l.value.clone(),
            })
            .collect(),
        samples: series
            .samples
            .iter()
            .map(|s| proto::Sample {
                value: Some(s.value),
                timestamp: s.timestamp,
            })
            .collect(),
    }
}

fn series_from_proto(series: proto::TimeSeries) -> Result<TimeSeries, CodecError> {
    let labels = Labels::new(series.labels.into_iter().map(|l| (l.name, l.value)))?;
    let samples = series
        .samples
        .into_iter()
        .map(|s| Sample::new(s.timestamp, s.value.unwrap_or_default()))
        .collect();
    Ok(TimeSeries { labels, samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(name: &str, samples: Vec<Sample>) -> TimeSeries {
        TimeSeries {
            labels: Labels::new([("__name__", name), ("job", "node")]).unwrap(),
            samples,
        }
    }

    fn estimate(batch: &Batch) -> usize {
        batch
            .series
            .iter()
            .map(|s| series_overhead(&s.labels) + s.samples.len() * SAMPLE_MAX_ENCODED_LEN)
            .sum()
    }

    #[test]
    fn round_trip_preserves_special_float_bits() {
        let payload_nan = f64::from_bits(0x7ff8_0000_0000_0001);
        let batch = Batch {
            series: vec![
                series(
                    "a",
                    vec![
                        Sample::new(i64::MIN, f64::NAN),
                        Sample::new(-1, payload_nan),
                        Sample::new(0, -0.0),
                        Sample::new(0, 0.0),
                    ],
                ),
                series(
                    "b",
                    vec![
                        Sample::new(i64::MAX, f64::INFINITY),
                        Sample::new(5, f64::NEG_INFINITY),
                        Sample::new(6, f64::MIN_POSITIVE),
                    ],
                ),
            ],
            estimated_bytes: 0,
        };

        let encoded = encode(&batch).unwrap();
        assert_eq!(encoded.series, 2);
        assert_eq!(encoded.samples, 7);

        let decoded = decode_write_request(&encoded.body).unwrap();
        assert_eq!(decoded.series, batch.series);
    }

    #[test]
    fn serialized_size_never_exceeds_estimate() {
        let long_value = "x".repeat(300);
        let batch = Batch {
            series: vec![
                TimeSeries {
                    labels: Labels::new([("__name__", "wide"), ("path", long_value.as_str())])
                        .unwrap(),
                    samples: (0..50)
                        .map(|i| Sample::new(i64::MIN + i, f64::from_bits(u64::MAX - i as u64)))
                        .collect(),
                },
                series("empty_label", vec![Sample::new(-1, -0.0)]),
            ],
            estimated_bytes: 0,
        };

        let encoded = encode(&batch).unwrap();
        assert!(encoded.uncompressed_len <= estimate(&batch));
    }

    #[test]
    fn empty_batch_encodes_to_empty_request() {
        let encoded = encode(&Batch::default()).unwrap();
        assert_eq!(encoded.uncompressed_len, 0);
        let decoded = decode_write_request(&encoded.body).unwrap();
        assert!(decoded.series.is_empty());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(decode_write_request(&[]), Err(CodecError::Empty)));
        assert!(matches!(decode_ack(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn rejects_truncated_input() {
        let batch = Batch {
            series: vec![series("a", (0..100).map(|i| Sample::new(i, i as f64)).collect())],
            estimated_bytes: 0,
        };
        let encoded = encode(&batch).unwrap();
        let truncated = &encoded.body[..encoded.body.len() / 2];
        assert!(matches!(
            decode_write_request(truncated),
            Err(CodecError::Decompress(_))
        ));
    }

    #[test]
    fn rejects_truncated_protobuf_inside_valid_snappy() {
        let batch = Batch {
            series: vec![series("a", vec![Sample::new(1, 1.0)])],
            estimated_bytes: 0,
        };
        let request = proto::WriteRequest {
            timeseries: batch.series.iter().map(series_to_proto).collect(),
        };
        let raw = request.encode_to_vec();
        let body = compress(&raw[..raw.len() - 3]).unwrap();
        assert!(matches!(
            decode_write_request(&body),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn rejects_oversized_declared_length() {
        // snappy preamble declaring a 128 MiB payload
        let body = [0x80, 0x80, 0x80, 0x40, 0x00];
        assert!(matches!(
            decode_write_request(&body),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_label_names() {
        let request = proto::WriteRequest {
            timeseries: vec![proto::TimeSeries {
                labels: vec![
                    proto::Label {
                        name: "job".to_owned(),
                        value: "a".to_owned(),
                    },
                    proto::Label {
                        name: "job".to_owned(),
                        value: "b".to_owned(),
                    },
                ],
                samples: vec![],
            }],
        };
        let body = compress(&request.encode_to_vec()).unwrap();
        let err = decode_write_request(&body).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage(_)));
        assert!(err.to_string().contains("duplicate label name: job"));
    }

    #[test]
    fn acknowledgement_round_trip() {
        let ack = Acknowledgement {
            series: vec![series("up", vec![Sample::new(1, 1.0), Sample::new(2, f64::NAN)])],
        };
        let body = encode_ack(&ack).unwrap();
        let decoded = decode_ack(&body).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.sample_count(), 2);
    }

    #[test]
    fn concurrent_encodes_do_not_share_buffers() {
        let batches: Vec<Batch> = (0..8)
            .map(|i| Batch {
                series: vec![series(
                    &format!("m{i}"),
                    (0..200).map(|t| Sample::new(t, (i * t) as f64)).collect(),
                )],
                estimated_bytes: 0,
            })
            .collect();

        std::thread::scope(|scope| {
            let handles: Vec<_> = batches
                .iter()
                .map(|batch| scope.spawn(move || encode(batch).unwrap()))
                .collect();
            for (batch, handle) in batches.iter().zip(handles) {
                let encoded = handle.join().unwrap();
                assert_eq!(decode_write_request(&encoded.body).unwrap().series, batch.series);
            }
        });
    }
}
