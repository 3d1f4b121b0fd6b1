use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::SAMPLE_RATE;

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("unknown filter: {0}")]
    Unknown(String),

    #[error("filter '{name}' argument {value} out of range {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Filtros de audio disponibles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    BassBoost,
    Nightcore,
    Vaporwave,
    EightD,
    Speed,
    Pitch,
    Volume,
    Karaoke,
    Tremolo,
    Vibrato,
}

impl FilterKind {
    pub const ALL: [FilterKind; 10] = [
        FilterKind::BassBoost,
        FilterKind::Nightcore,
        FilterKind::Vaporwave,
        FilterKind::EightD,
        FilterKind::Speed,
        FilterKind::Pitch,
        FilterKind::Volume,
        FilterKind::Karaoke,
        FilterKind::Tremolo,
        FilterKind::Vibrato,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::BassBoost => "bassboost",
            FilterKind::Nightcore => "nightcore",
            FilterKind::Vaporwave => "vaporwave",
            FilterKind::EightD => "8d",
            FilterKind::Speed => "speed",
            FilterKind::Pitch => "pitch",
            FilterKind::Volume => "volume",
            FilterKind::Karaoke => "karaoke",
            FilterKind::Tremolo => "tremolo",
            FilterKind::Vibrato => "vibrato",
        }
    }

    /// Argumento por defecto y rango válido, si el filtro acepta uno.
    fn argument(&self) -> Option<(f64, f64, f64)> {
        match self {
            FilterKind::BassBoost => Some((10.0, -20.0, 20.0)),
            FilterKind::Speed | FilterKind::Pitch => Some((1.0, 0.5, 2.0)),
            FilterKind::Volume => Some((1.0, 0.0, 5.0)),
            _ => None,
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilterKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or(FilterError::Unknown(s))
    }
}

/// Una entrada del catálogo con su argumento ya validado.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Filter {
    kind: FilterKind,
    arg: f64,
}

impl Filter {
    pub fn new(kind: FilterKind) -> Self {
        let arg = kind.argument().map(|(default, _, _)| default).unwrap_or(0.0);
        Self { kind, arg }
    }

    pub fn with_arg(kind: FilterKind, value: f64) -> Result<Self, FilterError> {
        match kind.argument() {
            Some((_, min, max)) if (min..=max).contains(&value) => Ok(Self { kind, arg: value }),
            Some((_, min, max)) => Err(FilterError::OutOfRange {
                name: kind.name(),
                value,
                min,
                max,
            }),
            // Filtros sin argumento lo ignoran
            None => Ok(Self::new(kind)),
        }
    }

    /// Parsea `nombre` o `nombre=valor`.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        match input.split_once('=') {
            Some((name, value)) => {
                let kind: FilterKind = name.parse()?;
                let value: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| FilterError::Unknown(input.to_string()))?;
                Self::with_arg(kind, value)
            }
            None => Ok(Self::new(input.parse()?)),
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Multiplicador de velocidad que introduce el filtro.
    pub fn speed(&self) -> f64 {
        match self.kind {
            FilterKind::Nightcore => 1.25,
            FilterKind::Vaporwave => 0.8,
            FilterKind::Speed => self.arg,
            _ => 1.0,
        }
    }

    /// Expresión `-af` para ffmpeg.
    pub fn expression(&self) -> String {
        let rate = SAMPLE_RATE;
        match self.kind {
            FilterKind::BassBoost => format!("bass=g={}", self.arg),
            FilterKind::Nightcore => format!("asetrate={rate}*1.25,aresample={rate}"),
            FilterKind::Vaporwave => format!("asetrate={rate}*0.8,aresample={rate}"),
            FilterKind::EightD => "apulsator=hz=0.08".to_string(),
            FilterKind::Speed => format!("atempo={}", self.arg),
            // Cambia el tono sin cambiar la duración
            FilterKind::Pitch => format!(
                "asetrate={rate}*{p},aresample={rate},atempo={inv}",
                p = self.arg,
                inv = 1.0 / self.arg
            ),
            FilterKind::Volume => format!("volume={}", self.arg),
            FilterKind::Karaoke => "stereotools=mlev=0.015625".to_string(),
            FilterKind::Tremolo => "tremolo=f=5:d=0.5".to_string(),
            FilterKind::Vibrato => "vibrato=f=6.5:d=0.5".to_string(),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.argument() {
            Some(_) => write!(f, "{}={}", self.kind, self.arg),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Cadena ordenada de filtros; un filtro repetido reemplaza al anterior.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Filter) {
        match self.filters.iter_mut().find(|f| f.kind == filter.kind) {
            Some(existing) => *existing = filter,
            None => self.filters.push(filter),
        }
    }

    pub fn remove(&mut self, kind: FilterKind) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f.kind != kind);
        before != self.filters.len()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Producto de los multiplicadores de velocidad.
    pub fn speed(&self) -> f64 {
        self.filters.iter().map(Filter::speed).product()
    }

    /// Argumento completo para `-af`, o `None` si la cadena está vacía.
    pub fn to_ffmpeg_arg(&self) -> Option<String> {
        if self.filters.is_empty() {
            return None;
        }
        Some(
            self.filters
                .iter()
                .map(Filter::expression)
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_arguments() {
        assert_eq!(Filter::parse("8d").unwrap().kind(), FilterKind::EightD);
        assert_eq!(Filter::parse("Speed=1.5").unwrap().speed(), 1.5);
        assert!(matches!(
            Filter::parse("speed=3"),
            Err(FilterError::OutOfRange { name: "speed", .. })
        ));
        assert!(matches!(Filter::parse("reverb"), Err(FilterError::Unknown(_))));
    }

    #[test]
    fn chain_renders_in_order_and_scales_speed() {
        let mut chain = FilterChain::new();
        assert_eq!(chain.to_ffmpeg_arg(), None);

        chain.push(Filter::new(FilterKind::BassBoost));
        chain.push(Filter::new(FilterKind::Nightcore));
        chain.push(Filter::with_arg(FilterKind::Speed, 2.0).unwrap());
        assert_eq!(
            chain.to_ffmpeg_arg().unwrap(),
            "bass=g=10,asetrate=48000*1.25,aresample=48000,atempo=2"
        );
        assert_eq!(chain.speed(), 2.5);

        // Reemplaza en su lugar
        chain.push(Filter::with_arg(FilterKind::Speed, 0.5).unwrap());
        assert_eq!(chain.filters().len(), 3);
        assert_eq!(chain.speed(), 0.625);

        assert!(chain.remove(FilterKind::Nightcore));
        assert!(!chain.remove(FilterKind::Nightcore));
        assert_eq!(chain.speed(), 0.5);
    }

    #[test]
    fn pitch_keeps_duration() {
        let pitch = Filter::with_arg(FilterKind::Pitch, 2.0).unwrap();
        assert_eq!(pitch.speed(), 1.0);
        assert!(pitch.expression().ends_with("atempo=0.5"));
    }
}
