//! Scanout pixel formats, identified on the wire by DRM fourcc codes.

pub const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const FOURCC_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const FOURCC_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const FOURCC_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const FOURCC_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
pub const FOURCC_RGB888: u32 = fourcc_code(b'R', b'G', b'2', b'4');
pub const FOURCC_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const FOURCC_XRGB1555: u32 = fourcc_code(b'X', b'R', b'1', b'5');
pub const FOURCC_ARGB1555: u32 = fourcc_code(b'A', b'R', b'1', b'5');

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Xrgb8888 = FOURCC_XRGB8888,
    Argb8888 = FOURCC_ARGB8888,
    Xbgr8888 = FOURCC_XBGR8888,
    Abgr8888 = FOURCC_ABGR8888,
    Rgb888 = FOURCC_RGB888,
    Rgb565 = FOURCC_RGB565,
    Xrgb1555 = FOURCC_XRGB1555,
    Argb1555 = FOURCC_ARGB1555,
}

impl PixelFormat {
    pub const fn from_fourcc(value: u32) -> Option<Self> {
        match value {
            FOURCC_XRGB8888 => Some(Self::Xrgb8888),
            FOURCC_ARGB8888 => Some(Self::Argb8888),
            FOURCC_XBGR8888 => Some(Self::Xbgr8888),
            FOURCC_ABGR8888 => Some(Self::Abgr8888),
            FOURCC_RGB888 => Some(Self::Rgb888),
            FOURCC_RGB565 => Some(Self::Rgb565),
            FOURCC_XRGB1555 => Some(Self::Xrgb1555),
            FOURCC_ARGB1555 => Some(Self::Argb1555),
            _ => None,
        }
    }

    pub const fn fourcc(self) -> u32 {
        self as u32
    }

    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Xrgb8888 | Self::Argb8888 | Self::Xbgr8888 | Self::Abgr8888 => 32,
            Self::Rgb888 => 24,
            Self::Rgb565 | Self::Xrgb1555 | Self::Argb1555 => 16,
        }
    }
}
