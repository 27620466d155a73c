use crate::{cc, file::TextureHeader, Error, Result};
use std::io::{self, Write};

/// The `DXGI_FORMAT` values a texture archive can carry that this crate
/// knows how to wrap in a DDS envelope.
pub(crate) mod dxgi {
    pub const R8G8B8A8_UNORM: u16 = 28;
    pub const R8_UNORM: u16 = 61;
    pub const BC1_UNORM: u16 = 71;
    pub const BC1_UNORM_SRGB: u16 = 72;
    pub const BC2_UNORM: u16 = 74;
    pub const BC2_UNORM_SRGB: u16 = 75;
    pub const BC3_UNORM: u16 = 77;
    pub const BC3_UNORM_SRGB: u16 = 78;
    pub const BC4_UNORM: u16 = 80;
    pub const BC5_UNORM: u16 = 83;
    pub const BC5_SNORM: u16 = 84;
    pub const B8G8R8A8_UNORM: u16 = 87;
    pub const B8G8R8X8_UNORM: u16 = 88;
    pub const BC7_UNORM: u16 = 98;
    pub const BC7_UNORM_SRGB: u16 = 99;
}

mod constants {
    use crate::cc;

    pub(crate) const MAGIC: u32 = cc::make_four(b"DDS ");

    pub(crate) const HEADER_SIZE: u32 = 124;
    pub(crate) const PIXELFORMAT_SIZE: u32 = 32;

    // DDSD_CAPS | DDSD_HEIGHT | DDSD_WIDTH | DDSD_PIXELFORMAT
    pub(crate) const HEADER_FLAGS_TEXTURE: u32 = 0x0000_1007;
    pub(crate) const HEADER_FLAGS_LINEARSIZE: u32 = 0x0008_0000;
    pub(crate) const HEADER_FLAGS_MIPMAP: u32 = 0x0002_0000;

    pub(crate) const SURFACE_FLAGS_TEXTURE: u32 = 0x0000_1000;
    // DDSCAPS_COMPLEX | DDSCAPS_MIPMAP
    pub(crate) const SURFACE_FLAGS_MIPMAP: u32 = 0x0040_0008;
    pub(crate) const CUBEMAP_ALLFACES: u32 = 0x0000_FE00;

    pub(crate) const DDPF_FOURCC: u32 = 0x0000_0004;
    pub(crate) const DDPF_RGB: u32 = 0x0000_0040;
    pub(crate) const DDPF_RGBA: u32 = 0x0000_0041;
    pub(crate) const DDPF_LUMINANCE: u32 = 0x0002_0000;

    pub(crate) const DX10_RESOURCE_DIMENSION_TEXTURE2D: u32 = 3;

    // the reserved word value that marks a texture as a full cubemap
    pub(crate) const CUBEMAP_SENTINEL: u16 = 2049;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PixelFormat {
    pub flags: u32,
    pub four_cc: u32,
    pub rgb_bit_count: u32,
    pub r_bit_mask: u32,
    pub g_bit_mask: u32,
    pub b_bit_mask: u32,
    pub a_bit_mask: u32,
}

impl PixelFormat {
    const fn four_cc(code: &[u8]) -> Self {
        Self {
            flags: constants::DDPF_FOURCC,
            four_cc: cc::make_four(code),
            rgb_bit_count: 0,
            r_bit_mask: 0,
            g_bit_mask: 0,
            b_bit_mask: 0,
            a_bit_mask: 0,
        }
    }

    const DXT1: Self = Self::four_cc(b"DXT1");
    const DXT3: Self = Self::four_cc(b"DXT3");
    const DXT5: Self = Self::four_cc(b"DXT5");
    const BC4_UNORM: Self = Self::four_cc(b"BC4U");
    const BC5_SNORM: Self = Self::four_cc(b"BC5S");
    const ATI2: Self = Self::four_cc(b"ATI2");
    const DX10: Self = Self::four_cc(b"DX10");

    const A8R8G8B8: Self = Self {
        flags: constants::DDPF_RGBA,
        four_cc: 0,
        rgb_bit_count: 32,
        r_bit_mask: 0x00FF_0000,
        g_bit_mask: 0x0000_FF00,
        b_bit_mask: 0x0000_00FF,
        a_bit_mask: 0xFF00_0000,
    };

    const A8B8G8R8: Self = Self {
        flags: constants::DDPF_RGBA,
        four_cc: 0,
        rgb_bit_count: 32,
        r_bit_mask: 0x0000_00FF,
        g_bit_mask: 0x0000_FF00,
        b_bit_mask: 0x00FF_0000,
        a_bit_mask: 0xFF00_0000,
    };

    const X8B8G8R8: Self = Self {
        flags: constants::DDPF_RGB,
        four_cc: 0,
        rgb_bit_count: 32,
        r_bit_mask: 0x0000_00FF,
        g_bit_mask: 0x0000_FF00,
        b_bit_mask: 0x00FF_0000,
        a_bit_mask: 0,
    };

    const L8: Self = Self {
        flags: constants::DDPF_LUMINANCE,
        four_cc: 0,
        rgb_bit_count: 8,
        r_bit_mask: 0x0000_00FF,
        g_bit_mask: 0,
        b_bit_mask: 0,
        a_bit_mask: 0,
    };
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DdsHeader {
    pub flags: u32,
    pub height: u32,
    pub width: u32,
    pub pitch_or_linear_size: u32,
    pub mip_map_count: u32,
    pub ddspf: PixelFormat,
    pub caps: u32,
    pub caps2: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Dx10Header {
    pub dxgi_format: u32,
}

/// Maps a stored texture header onto the DDS header (and, for formats the
/// legacy header cannot express, the DXT10 extension header) that extraction
/// prepends to the chunk payload.
pub(crate) fn synthesize(texture: &TextureHeader) -> Result<(DdsHeader, Option<Dx10Header>)> {
    let width = u32::from(texture.width);
    let height = u32::from(texture.height);

    let mut header = DdsHeader {
        flags: constants::HEADER_FLAGS_TEXTURE
            | constants::HEADER_FLAGS_LINEARSIZE
            | constants::HEADER_FLAGS_MIPMAP,
        height,
        width,
        pitch_or_linear_size: 0,
        mip_map_count: u32::from(texture.mip_count),
        ddspf: PixelFormat::default(),
        caps: constants::SURFACE_FLAGS_TEXTURE | constants::SURFACE_FLAGS_MIPMAP,
        caps2: 0,
    };
    if texture.unknown2 == constants::CUBEMAP_SENTINEL {
        header.caps2 = constants::CUBEMAP_ALLFACES;
    }

    let mut dx10 = None;
    match texture.format {
        dxgi::BC1_UNORM | dxgi::BC1_UNORM_SRGB => {
            header.ddspf = PixelFormat::DXT1;
            header.pitch_or_linear_size = width * height / 2;
        }
        dxgi::BC2_UNORM | dxgi::BC2_UNORM_SRGB => {
            header.ddspf = PixelFormat::DXT3;
            header.pitch_or_linear_size = width * height;
        }
        dxgi::BC3_UNORM | dxgi::BC3_UNORM_SRGB => {
            header.ddspf = PixelFormat::DXT5;
            header.pitch_or_linear_size = width * height;
        }
        dxgi::BC4_UNORM => {
            header.ddspf = PixelFormat::BC4_UNORM;
            header.pitch_or_linear_size = width * height;
        }
        dxgi::BC5_UNORM => {
            header.ddspf = PixelFormat::ATI2;
            header.pitch_or_linear_size = width * height;
        }
        dxgi::BC5_SNORM => {
            header.ddspf = PixelFormat::BC5_SNORM;
            header.pitch_or_linear_size = width * height;
        }
        dxgi::BC7_UNORM | dxgi::BC7_UNORM_SRGB => {
            header.ddspf = PixelFormat::DX10;
            header.pitch_or_linear_size = width * height;
            dx10 = Some(Dx10Header {
                dxgi_format: u32::from(texture.format),
            });
        }
        dxgi::R8G8B8A8_UNORM => {
            header.ddspf = PixelFormat::A8R8G8B8;
            header.pitch_or_linear_size = width * height * 4;
        }
        dxgi::B8G8R8A8_UNORM => {
            header.ddspf = PixelFormat::A8B8G8R8;
            header.pitch_or_linear_size = width * height * 4;
        }
        dxgi::B8G8R8X8_UNORM => {
            header.ddspf = PixelFormat::X8B8G8R8;
        }
        dxgi::R8_UNORM => {
            header.ddspf = PixelFormat::L8;
            header.pitch_or_linear_size = width * height;
        }
        format => {
            return Err(Error::InvalidData(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported DXGI format: {format}"),
            )));
        }
    }

    Ok((header, dx10))
}

/// Writes the `"DDS "` magic, the 124-byte header, and the optional 20-byte
/// DXT10 extension header.
pub(crate) fn write_envelope<W>(
    stream: &mut W,
    header: &DdsHeader,
    dx10: Option<&Dx10Header>,
) -> io::Result<()>
where
    W: ?Sized + Write,
{
    let mut out = [0u32; 32];
    out[0] = constants::MAGIC;
    out[1] = constants::HEADER_SIZE;
    out[2] = header.flags;
    out[3] = header.height;
    out[4] = header.width;
    out[5] = header.pitch_or_linear_size;
    // out[6] is depth and out[8..=18] are reserved; both stay zero
    out[7] = header.mip_map_count;
    out[19] = constants::PIXELFORMAT_SIZE;
    out[20] = header.ddspf.flags;
    out[21] = header.ddspf.four_cc;
    out[22] = header.ddspf.rgb_bit_count;
    out[23] = header.ddspf.r_bit_mask;
    out[24] = header.ddspf.g_bit_mask;
    out[25] = header.ddspf.b_bit_mask;
    out[26] = header.ddspf.a_bit_mask;
    out[27] = header.caps;
    out[28] = header.caps2;
    // caps3, caps4, and the final reserved word stay zero

    for word in out {
        stream.write_all(&word.to_le_bytes())?;
    }

    if let Some(dx10) = dx10 {
        for word in [
            dx10.dxgi_format,
            constants::DX10_RESOURCE_DIMENSION_TEXTURE2D,
            0, // miscFlag
            1, // arraySize
            0, // miscFlags2
        ] {
            stream.write_all(&word.to_le_bytes())?;
        }
    }

    Ok(())
}
