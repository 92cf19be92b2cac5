use tokio::net::TcpStream;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame accepted on a disk node connection, a write body plus
/// headroom for the request envelope.
pub const MAX_FRAME_LENGTH: usize = 65 * 1024 * 1024;

type FrameType = Framed<TcpStream, LengthDelimitedCodec>;
type Codec<I, O> = Bincode<I, O>;

/// A stream recieving: I: incoming item, O: outgoing
pub type MsgStream<I, O> = tokio_serde::Framed<FrameType, I, O, Codec<I, O>>;

/// I: incoming item, O: outgoing
pub fn wrap<I, O>(stream: TcpStream) -> MsgStream<I, O> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    let length_delimited = Framed::new(stream, codec);
    tokio_serde::Framed::new(length_delimited, Bincode::<I, O>::default())
}
