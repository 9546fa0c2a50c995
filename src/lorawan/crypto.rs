//! AES-128 primitives for the LoRaWAN MAC layer.
//!
//! Three operations cover everything the protocol needs: single-block
//! AES-128-ECB (also the key-derivation function at join), AES-CMAC-128
//! truncated to 4 bytes for the MIC, and the CTR-like payload cipher that
//! XORs each 16-byte block with `AES-ECB(key, A_i)`. The payload cipher is
//! its own inverse.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// Direction byte used in the A_i and B_0 blocks.
pub const UP: u8 = 0;
/// Direction byte used in the A_i and B_0 blocks.
pub const DOWN: u8 = 1;

/// AES-128-ECB encryption of a single 16-byte block.
pub fn aes128_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    aes.encrypt_block(&mut out);
    out.into()
}

/// AES-128-ECB decryption of a single 16-byte block.
pub fn aes128_decrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    aes.decrypt_block(&mut out);
    out.into()
}

/// AES-128-ECB decryption over a whole-multiple-of-16 buffer. The
/// join-accept envelope is produced this way so that the device recovers
/// the plaintext by encrypting.
pub fn aes128_decrypt_blocks(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(16) {
        aes.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// AES-128-ECB encryption over a whole-multiple-of-16 buffer (the
/// device-side inverse of [`aes128_decrypt_blocks`]).
pub fn aes128_encrypt_blocks(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(16) {
        aes.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// AES-CMAC-128 truncated to the first 4 octets of the tag.
pub fn cmac4(key: &[u8; 16], msg: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    [tag[0], tag[1], tag[2], tag[3]]
}

/// MIC of a data frame: CMAC over `B_0 || MHDR || MACPayload`, truncated.
pub fn data_mic(key: &[u8; 16], dir: u8, dev_addr: u32, fcnt: u32, msg: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(&b0(dir, dev_addr, fcnt, msg.len()));
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    [tag[0], tag[1], tag[2], tag[3]]
}

// B_0 and A_i share everything but the first and last byte.
fn helper_block(first: u8, dir: u8, dev_addr: u32, fcnt: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = first;
    block[5] = dir;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block
}

/// The B_0 authentication block prepended to the CMAC input.
pub fn b0(dir: u8, dev_addr: u32, fcnt: u32, len: usize) -> [u8; 16] {
    let mut block = helper_block(0x49, dir, dev_addr, fcnt);
    block[15] = len as u8;
    block
}

fn ai(dir: u8, dev_addr: u32, fcnt: u32, i: u8) -> [u8; 16] {
    let mut block = helper_block(0x01, dir, dev_addr, fcnt);
    block[15] = i;
    block
}

/// LoRaWAN payload cipher. Involutive: applying it twice with the same
/// parameters yields the original message.
pub fn cipher(key: &[u8; 16], dir: u8, dev_addr: u32, fcnt: u32, data: &[u8]) -> Vec<u8> {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for (i, chunk) in out.chunks_mut(16).enumerate() {
        let block = ai(dir, dev_addr, fcnt, (i + 1) as u8);
        let mut keystream = GenericArray::clone_from_slice(&block);
        aes.encrypt_block(&mut keystream);
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
    }
    out
}

/// Zero-right-pad to a multiple of 16 bytes.
pub fn padded16(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % 16;
    if rem != 0 {
        out.resize(out.len() + 16 - rem, 0);
    }
    out
}
