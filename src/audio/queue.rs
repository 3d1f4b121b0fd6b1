use anyhow::Result;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, collections::VecDeque, fmt, time::Duration};
use tracing::{debug, info};

use crate::sources::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    /// Repite la canción actual
    Song,
    /// Repite toda la cola
    Songs,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "off",
            LoopMode::Song => "song",
            LoopMode::Songs => "songs",
        })
    }
}

/// Cola de un guild. El índice 0 es siempre la canción que suena.
#[derive(Debug)]
pub struct Queue {
    tracks: VecDeque<Track>,
    loop_mode: LoopMode,
    shuffle: bool,
    radio: bool,
    max_size: usize,
}

impl Queue {
    pub fn new(max_size: usize) -> Self {
        Self {
            tracks: VecDeque::new(),
            loop_mode: LoopMode::Off,
            shuffle: false,
            radio: false,
            max_size,
        }
    }

    /// Agrega un track al final; devuelve su posición
    pub fn push(&mut self, track: Track) -> Result<usize> {
        if self.tracks.len() >= self.max_size {
            anyhow::bail!("La cola está llena (máximo {} canciones)", self.max_size);
        }

        info!("➕ Agregado a la cola: {}", track.title);
        self.tracks.push_back(track);
        Ok(self.tracks.len() - 1)
    }

    /// Agrega múltiples tracks (playlist) hasta llenar la cola
    pub fn push_many(&mut self, tracks: Vec<Track>) -> usize {
        let available_space = self.max_size.saturating_sub(self.tracks.len());
        let to_add = tracks.len().min(available_space);
        self.tracks.extend(tracks.into_iter().take(to_add));

        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.front()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// La canción actual terminó de forma natural. Devuelve la siguiente.
    pub fn on_track_finished(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }

        match self.loop_mode {
            LoopMode::Song => {
                debug!("🔂 Repitiendo canción");
            }
            LoopMode::Songs => self.rotate(1),
            LoopMode::Off if self.radio => {
                self.rotate(1);
                if self.shuffle && self.tracks.len() > 2 {
                    // La que acaba de terminar se queda al final
                    let upcoming = self.tracks.len() - 1;
                    self.tracks.make_contiguous()[..upcoming].shuffle(&mut rand::thread_rng());
                }
            }
            LoopMode::Off => {
                self.tracks.pop_front();
                if self.shuffle {
                    self.tracks.make_contiguous().shuffle(&mut rand::thread_rng());
                }
            }
        }

        match self.tracks.front() {
            Some(next) => info!("➡️ Siguiente en cola: {}", next.title),
            None => info!("📭 Cola vacía, no hay siguiente track"),
        }
        self.tracks.front()
    }

    /// Salta `count` canciones desde la actual.
    ///
    /// Con loop de cola o radio las saltadas pasan al final; si no, se descartan.
    pub fn skip(&mut self, count: usize) -> usize {
        let skipped = count.min(self.tracks.len());
        if skipped == 0 {
            return 0;
        }

        if self.loop_mode == LoopMode::Songs || self.radio {
            self.rotate(skipped);
        } else {
            self.tracks.drain(..skipped);
        }
        debug!("⏭️ Saltadas {} canciones", skipped);
        skipped
    }

    fn rotate(&mut self, count: usize) {
        let count = count.min(self.tracks.len());
        self.tracks.rotate_left(count);
    }

    /// Elimina un track específico
    pub fn remove(&mut self, index: usize) -> Result<Track> {
        let track = self
            .tracks
            .remove(index)
            .ok_or_else(|| anyhow::anyhow!("Índice fuera de rango"))?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(track)
    }

    /// Mueve un track a una nueva posición (nunca el que suena)
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        if from == 0 || to == 0 {
            anyhow::bail!("No se puede mover la canción actual");
        }
        if from >= self.tracks.len() || to >= self.tracks.len() {
            anyhow::bail!("Índice fuera de rango");
        }

        if from != to {
            let track = self
                .tracks
                .remove(from)
                .ok_or_else(|| anyhow::anyhow!("No se pudo remover el item"))?;
            self.tracks.insert(to, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Limpia la cola, conservando la canción actual
    pub fn clear(&mut self) -> usize {
        let removed = self.tracks.len().saturating_sub(1);
        self.tracks.truncate(1);
        info!("🗑️ Cola limpiada ({} canciones)", removed);
        removed
    }

    /// Vacía la cola por completo
    pub fn clear_all(&mut self) {
        self.tracks.clear();
    }

    /// Limpia duplicados por URL, conservando la primera aparición
    pub fn remove_duplicates(&mut self) -> usize {
        let mut seen = HashSet::new();
        let original_len = self.tracks.len();

        self.tracks.retain(|track| seen.insert(track.url.clone()));

        let removed = original_len - self.tracks.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados", removed);
        }
        removed
    }

    /// Mezcla las próximas canciones (no la actual)
    pub fn shuffle_upcoming(&mut self) {
        if self.tracks.len() > 2 {
            self.tracks.make_contiguous()[1..].shuffle(&mut rand::thread_rng());
            info!("🔀 Cola mezclada");
        }
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Song => info!("🔂 Repetir canción activado"),
            LoopMode::Songs => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Cambia el modo aleatorio
    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle = !self.shuffle;
        if self.shuffle {
            info!("🔀 Modo aleatorio activado");
        } else {
            info!("➡️ Modo aleatorio desactivado");
        }
        self.shuffle
    }

    pub fn is_shuffle(&self) -> bool {
        self.shuffle
    }

    /// Modo radio: las canciones terminadas vuelven al final
    pub fn toggle_radio(&mut self) -> bool {
        self.radio = !self.radio;
        info!("📻 Modo radio: {}", if self.radio { "on" } else { "off" });
        self.radio
    }

    pub fn is_radio(&self) -> bool {
        self.radio
    }

    pub fn total_duration(&self) -> Duration {
        self.tracks.iter().map(Track::duration).sum()
    }

    /// Obtiene información de la cola
    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            current: self.tracks.front().cloned(),
            items: self.tracks.iter().skip(1).cloned().collect(),
            total_items: self.tracks.len().saturating_sub(1),
            loop_mode: self.loop_mode,
            shuffle: self.shuffle,
            radio: self.radio,
            total_duration: self.total_duration(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub current: Option<Track>,
    pub items: Vec<Track>,
    pub total_items: usize,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub radio: bool,
    pub total_duration: Duration,
}

impl QueueInfo {
    /// Obtiene una página específica de las próximas canciones
    pub fn get_page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let safe_page = page.max(1);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());
        let total_pages = if self.total_items == 0 {
            1
        } else {
            self.total_items.div_ceil(items_per_page)
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
