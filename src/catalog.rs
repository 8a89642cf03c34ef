use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{CohortYear, ModuleReference};

/// Minimum percentage that approves a module test.
pub const PASSING_THRESHOLD: u32 = 70;

#[derive(Debug)]
pub struct Module {
    pub sequence_number: u32,
    pub title: &'static str,
    pub passing_threshold: u32,
    /// Canonical slug legacy records carry in their slug field.
    pub slug: &'static str,
    /// Keyword pattern tested against raw legacy record keys.
    pub keyword: Regex,
}

#[derive(Debug)]
pub struct Catalog {
    pub year: CohortYear,
    pub title: &'static str,
    modules: Vec<Module>,
}

struct ModuleSeed {
    title: &'static str,
    slug: &'static str,
    keyword: &'static str,
}

const FIRST_YEAR_SEEDS: [ModuleSeed; 6] = [
    ModuleSeed {
        title: "Introducción a la Informática",
        slug: "introduccion_informatica",
        keyword: r"(?i)intro",
    },
    ModuleSeed {
        title: "Soporte Técnico",
        slug: "soporte_tecnico",
        keyword: r"(?i)soporte",
    },
    ModuleSeed {
        title: "Sistema Operativo",
        slug: "sistema_operativo",
        keyword: r"(?i)sistema.*operativo|(^|[_\-])so([_\-]|$)",
    },
    ModuleSeed {
        title: "Ofimática Básica",
        slug: "ofimatica_basica",
        keyword: r"(?i)ofimatica|(^|[_\-])ofi([_\-]|$)",
    },
    ModuleSeed {
        title: "Internet Seguro",
        slug: "internet_seguro",
        keyword: r"(?i)internet|(^|[_\-])inter([_\-]|$)",
    },
    ModuleSeed {
        title: "Programación Básica",
        slug: "programacion_basica",
        keyword: r"(?i)programacion|(^|[_\-])prog([_\-]|$)",
    },
];

const SECOND_YEAR_SEEDS: [ModuleSeed; 8] = [
    ModuleSeed {
        title: "Algoritmos y Lógica",
        slug: "algoritmos_logica",
        keyword: r"(?i)algoritmo|(^|[_\-])algo([_\-]|$)",
    },
    ModuleSeed {
        title: "Programación Avanzada",
        slug: "programacion_media_avanzada",
        keyword: r"(?i)programacion.*(media|avanzada)|(^|[_\-])pma([_\-]|$)",
    },
    ModuleSeed {
        title: "Diseño Web",
        slug: "diseno_web_basico",
        keyword: r"(?i)diseno.*web|(^|[_\-])web([_\-]|$)",
    },
    ModuleSeed {
        title: "Seguridad Informática",
        slug: "seguridad_informatica",
        keyword: r"(?i)seguridad|(^|[_\-])seg([_\-]|$)",
    },
    ModuleSeed {
        title: "Bases de Datos",
        slug: "bases_de_datos_basicas",
        keyword: r"(?i)bases?.*datos|(^|[_\-])bd([_\-]|$)",
    },
    ModuleSeed {
        title: "POO",
        slug: "programacion_orientada_objetos",
        keyword: r"(?i)orientada.*objetos|(^|[_\-])poo([_\-]|$)",
    },
    ModuleSeed {
        title: "Redes",
        slug: "redes_informaticas_basicas",
        keyword: r"(?i)redes|(^|[_\-])red([_\-]|$)",
    },
    ModuleSeed {
        title: "Pensamiento Computacional",
        slug: "pensamiento_computacional",
        keyword: r"(?i)pensamiento|(^|[_\-])pc([_\-]|$)",
    },
];

lazy_static! {
    static ref FIRST_YEAR: Catalog = Catalog::build(
        CohortYear::First,
        "Primero de Bachillerato",
        &FIRST_YEAR_SEEDS
    );
    static ref SECOND_YEAR: Catalog = Catalog::build(
        CohortYear::Second,
        "Segundo de Bachillerato",
        &SECOND_YEAR_SEEDS
    );
}

impl Catalog {
    pub fn for_year(year: CohortYear) -> &'static Catalog {
        match year {
            CohortYear::First => &FIRST_YEAR,
            CohortYear::Second => &SECOND_YEAR,
        }
    }

    fn build(year: CohortYear, title: &'static str, seeds: &[ModuleSeed]) -> Catalog {
        let modules = seeds
            .iter()
            .zip(1u32..)
            .map(|(seed, sequence_number)| Module {
                sequence_number,
                title: seed.title,
                passing_threshold: PASSING_THRESHOLD,
                slug: seed.slug,
                keyword: Regex::new(seed.keyword).unwrap(),
            })
            .collect();

        Catalog {
            year,
            title,
            modules,
        }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, sequence_number: u32) -> Option<&Module> {
        sequence_number
            .checked_sub(1)
            .and_then(|index| self.modules.get(index as usize))
    }

    pub fn module_for_slug(&self, slug: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.slug == slug)
    }

    pub fn total_modules(&self) -> u32 {
        self.modules.len() as u32
    }

    pub fn reference(&self, sequence_number: u32) -> Option<ModuleReference> {
        self.module(sequence_number).map(|module| ModuleReference {
            year: self.year,
            sequence_number: module.sequence_number,
        })
    }
}

/// Key under which a first attempt is stored.
pub fn record_key(reference: ModuleReference) -> String {
    format!("module{}", reference.sequence_number)
}
