use rand::Rng;
use std::fmt;

/// The fixed catalog of service-time classes. Preparation times are in
/// clock units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Drink {
    Beer,
    Cider,
    GinAndTonic,
    Martini,
    Cosmopolitan,
    BloodyMary,
    Margarita,
    Mojito,
    PinaColada,
    LongIslandIcedTea,
    B52,
}

impl Drink {
    pub const ALL: [Drink; 11] = [
        Drink::Beer,
        Drink::Cider,
        Drink::GinAndTonic,
        Drink::Martini,
        Drink::Cosmopolitan,
        Drink::BloodyMary,
        Drink::Margarita,
        Drink::Mojito,
        Drink::PinaColada,
        Drink::LongIslandIcedTea,
        Drink::B52,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Drink::Beer => "Beer",
            Drink::Cider => "Cider",
            Drink::GinAndTonic => "Gin and Tonic",
            Drink::Martini => "Martini",
            Drink::Cosmopolitan => "Cosmopolitan",
            Drink::BloodyMary => "Bloody Mary",
            Drink::Margarita => "Margarita",
            Drink::Mojito => "Mojito",
            Drink::PinaColada => "Pina Colada",
            Drink::LongIslandIcedTea => "Long Island Iced Tea",
            Drink::B52 => "B52",
        }
    }

    pub fn preparation_time(self) -> u64 {
        match self {
            Drink::Beer | Drink::Cider => 10,
            Drink::GinAndTonic => 30,
            Drink::Martini => 50,
            Drink::Cosmopolitan => 80,
            Drink::BloodyMary => 90,
            Drink::Margarita => 100,
            Drink::Mojito => 120,
            Drink::PinaColada => 200,
            Drink::LongIslandIcedTea => 300,
            Drink::B52 => 500,
        }
    }

    /// Uniform pick from the catalog.
    pub fn random(rng: &mut impl Rng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

impl fmt::Display for Drink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
