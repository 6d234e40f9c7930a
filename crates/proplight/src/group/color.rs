//! Color space conversions used by aggregation and command fan-out.
//!
//! Hue is in degrees [0, 360), saturation in percent [0, 100], RGB channels
//! in [0, 255] and XY in CIE 1931 coordinates. All functions are pure.

use palette::FromColor;
use palette::Hsv;
use palette::LinSrgb;
use palette::ShiftHue;
use palette::Srgb;
use palette::Xyz;
use palette::Yxy;
use palette::convert::FromColorUnclamped;
use palette::encoding;
use palette::white_point::D65;

/// Color temperature assumed when a device reports none that is usable.
pub const DEFAULT_KELVIN: u32 = 3000;

/// Hue/saturation pair.
pub type Hs = (f64, f64);

type SrgbHsv = Hsv<encoding::Srgb, f64>;

/// Linear Wide RGB D65 to XYZ. Bulbs report xy in this gamut, not sRGB.
const WIDE_RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.664511, 0.154324, 0.162028],
    [0.283881, 0.668433, 0.047685],
    [0.000088, 0.072310, 0.986039],
];

const XYZ_TO_WIDE_RGB: [[f64; 3]; 3] = [
    [1.656492, -0.354851, -0.255038],
    [-0.707196, 1.655397, 0.036152],
    [0.051713, -0.121364, 1.011530],
];

fn hsv(hue: f64, saturation: f64, value: f64) -> SrgbHsv {
    SrgbHsv::new(hue, (saturation / 100.0).clamp(0.0, 1.0), value.clamp(0.0, 1.0))
}

fn hs_of(hsv: SrgbHsv) -> Hs {
    (hsv.hue.into_positive_degrees(), hsv.saturation * 100.0)
}

/// Hue/saturation at full value to RGB.
pub fn hs_to_rgb(hue: f64, saturation: f64) -> (u8, u8, u8) {
    channels(Srgb::from_color(hsv(hue, saturation, 1.0)))
}

/// RGB to hue/saturation, discarding value.
pub fn rgb_to_hs(r: f64, g: f64, b: f64) -> Hs {
    hs_of(SrgbHsv::from_color(Srgb::new(r / 255.0, g / 255.0, b / 255.0)))
}

/// Rotate the hue of an RGB color, keeping its saturation and value.
pub fn shift_rgb_hue((r, g, b): (u8, u8, u8), offset: f64) -> (u8, u8, u8) {
    let shifted = SrgbHsv::from_color(Srgb::new(r, g, b).into_format::<f64>()).shift_hue(offset);
    channels(Srgb::from_color(shifted))
}

/// CIE xy at full brightness to RGB in the Wide RGB D65 gamut.
///
/// Returns `None` for coordinates that cannot describe a color.
pub fn xy_to_rgb(x: f64, y: f64) -> Option<(u8, u8, u8)> {
    if !x.is_finite() || !y.is_finite() || y <= 0.0 || x < 0.0 {
        return None;
    }

    let xyz = Xyz::<D65, f64>::from_color_unclamped(Yxy::<D65, f64>::new(x, y, 1.0));
    let [r, g, b] = apply(&XYZ_TO_WIDE_RGB, [xyz.x, xyz.y, xyz.z]);

    let encoded = Srgb::<f64>::from_linear(LinSrgb::new(r, g, b));
    let [r, g, b] = [encoded.red, encoded.green, encoded.blue].map(|c| c.max(0.0));

    let max = r.max(g).max(b);
    let [r, g, b] = if max > 1.0 {
        [r / max, g / max, b / max]
    } else {
        [r, g, b]
    };

    Some(channels(Srgb::new(r, g, b)))
}

/// RGB to CIE xy, rounded to three decimals.
///
/// Black has no chromaticity and yields `None`.
pub fn rgb_to_xy(r: u8, g: u8, b: u8) -> Option<(f64, f64)> {
    if u16::from(r) + u16::from(g) + u16::from(b) == 0 {
        return None;
    }

    let linear: LinSrgb<f64> = Srgb::new(r, g, b).into_format::<f64>().into_linear();
    let [big_x, big_y, big_z] = apply(&WIDE_RGB_TO_XYZ, [linear.red, linear.green, linear.blue]);
    if big_x + big_y + big_z <= 0.0 {
        return None;
    }

    let yxy = Yxy::<D65, f64>::from_color_unclamped(Xyz::<D65, f64>::new(big_x, big_y, big_z));
    Some((round3(yxy.x), round3(yxy.y)))
}

pub fn xy_to_hs(x: f64, y: f64) -> Option<Hs> {
    let (r, g, b) = xy_to_rgb(x, y)?;
    Some(rgb_to_hs(f64::from(r), f64::from(g), f64::from(b)))
}

pub fn hs_to_xy(hue: f64, saturation: f64) -> Option<(f64, f64)> {
    let (r, g, b) = hs_to_rgb(hue, saturation);
    rgb_to_xy(r, g, b)
}

/// Approximate RGB of a black body at `kelvin` (clamped to 1000..=40000).
pub fn kelvin_to_rgb(kelvin: u32) -> (f64, f64, f64) {
    let temp = f64::from(kelvin.clamp(1000, 40000)) / 100.0;

    let red = if temp <= 66.0 {
        255.0
    } else {
        329.698727446 * (temp - 60.0).powf(-0.1332047592)
    };

    let green = if temp <= 66.0 {
        99.4708025861 * temp.ln() - 161.1195681661
    } else {
        288.1221695283 * (temp - 60.0).powf(-0.0755148492)
    };

    let blue = if temp >= 66.0 {
        255.0
    } else if temp <= 19.0 {
        0.0
    } else {
        138.5177312231 * (temp - 10.0).ln() - 305.0447927307
    };

    (
        red.clamp(0.0, 255.0),
        green.clamp(0.0, 255.0),
        blue.clamp(0.0, 255.0),
    )
}

pub fn kelvin_to_hs(kelvin: u32) -> Hs {
    let (r, g, b) = kelvin_to_rgb(kelvin);
    rgb_to_hs(r, g, b)
}

pub fn mired_to_kelvin(mired: f64) -> u32 {
    if mired <= 0.0 || !mired.is_finite() {
        return DEFAULT_KELVIN;
    }
    (1_000_000.0 / mired).round() as u32
}

/// Rotate a hue by `offset` degrees, wrapping into [0, 360).
pub fn shift_hue(hue: f64, offset: f64) -> f64 {
    (hue + offset).rem_euclid(360.0)
}

/// Average colors by mixing them in RGB at full value.
///
/// Red and blue average to purple rather than to whatever hue lies halfway
/// around the wheel. A single color is returned as is.
pub fn average_colors(colors: &[Hs]) -> Option<Hs> {
    match colors {
        [] => None,
        [only] => Some(*only),
        _ => {
            let (r, g, b) = colors.iter().fold((0.0, 0.0, 0.0), |acc, (h, s)| {
                let rgb = Srgb::<f64>::from_color(hsv(*h, *s, 1.0));
                (acc.0 + rgb.red, acc.1 + rgb.green, acc.2 + rgb.blue)
            });
            let n = colors.len() as f64;
            Some(hs_of(SrgbHsv::from_color(Srgb::new(r / n, g / n, b / n))))
        }
    }
}

fn apply(matrix: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    matrix.map(|row| row[0] * v[0] + row[1] * v[1] + row[2] * v[2])
}

fn channels(rgb: Srgb<f64>) -> (u8, u8, u8) {
    (
        to_channel(rgb.red * 255.0),
        to_channel(rgb.green * 255.0),
        to_channel(rgb.blue * 255.0),
    )
}

fn to_channel(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
